use crate::error::{CoderError, Result};
use crate::{CONTENT_TYPE_JSON_ALIAS, CborCoder, Coder, JsonCoder};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Coders keyed by content type.
///
/// The default registry knows JSON (also under `application/json`) and CBOR.
#[derive(Clone)]
pub struct CoderRegistry {
    coders: HashMap<String, Arc<dyn Coder>>,
}

impl CoderRegistry {
    /// Create a registry with no coders.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            coders: HashMap::new(),
        }
    }

    /// Add a coder, replacing any coder with the same content type.
    pub fn register(&mut self, coder: impl Coder) -> &mut Self {
        let coder: Arc<dyn Coder> = Arc::new(coder);
        self.coders.insert(coder.content_type().to_string(), coder);
        self
    }

    /// Make `alias` resolve to the coder registered under `content_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if `content_type` is not registered.
    pub fn alias(&mut self, alias: &str, content_type: &str) -> Result<&mut Self> {
        let coder = self.get(content_type)?;
        self.coders.insert(alias.to_string(), coder);
        Ok(self)
    }

    /// Look up a coder.
    ///
    /// # Errors
    ///
    /// Returns [`CoderError::UnknownContentType`] if nothing is registered.
    pub fn get(&self, content_type: &str) -> Result<Arc<dyn Coder>> {
        self.coders
            .get(content_type)
            .cloned()
            .ok_or_else(|| CoderError::UnknownContentType(content_type.to_string()))
    }

    /// Returns `true` if a coder is registered under `content_type`.
    #[must_use]
    pub fn contains(&self, content_type: &str) -> bool {
        self.coders.contains_key(content_type)
    }
}

impl Default for CoderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(JsonCoder).register(CborCoder);
        registry
            .coders
            .insert(CONTENT_TYPE_JSON_ALIAS.to_string(), Arc::new(JsonCoder));
        registry
    }
}

impl fmt::Debug for CoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.coders.keys().collect();
        names.sort();
        f.debug_struct("CoderRegistry")
            .field("content_types", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CONTENT_TYPE_CBOR, CONTENT_TYPE_JSON};

    #[test]
    fn test_default_registry() {
        let registry = CoderRegistry::default();
        assert!(registry.contains(CONTENT_TYPE_JSON));
        assert!(registry.contains(CONTENT_TYPE_JSON_ALIAS));
        assert!(registry.contains(CONTENT_TYPE_CBOR));
        assert_eq!(
            registry.get(CONTENT_TYPE_JSON_ALIAS).unwrap().content_type(),
            CONTENT_TYPE_JSON
        );
    }

    #[test]
    fn test_unknown_content_type() {
        let registry = CoderRegistry::empty();
        assert_eq!(
            registry.get("text/xml").err(),
            Some(CoderError::UnknownContentType("text/xml".to_string()))
        );
    }

    #[test]
    fn test_alias() {
        let mut registry = CoderRegistry::empty();
        registry.register(CborCoder);
        registry.alias("cbor", CONTENT_TYPE_CBOR).unwrap();
        assert!(registry.contains("cbor"));
        assert!(registry.alias("x", "missing").is_err());
    }
}
