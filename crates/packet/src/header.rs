//! `key=value;` property bag carried in the packet header.
//!
//! Neither `;` nor `=` is escaped, so values must not contain them.

use bytes::Bytes;
use std::fmt;

/// Header property carrying an error status code.
pub const PROPERTY_CODE: &str = "code";

/// Header property carrying an error message.
pub const PROPERTY_MESSAGE: &str = "message";

/// Header property naming the body coder.
pub const PROPERTY_CONTENT_TYPE: &str = "content-type";

/// Ordered set of header properties.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderBag {
    raw: String,
}

impl HeaderBag {
    /// Create an empty bag.
    #[must_use]
    pub const fn new() -> Self {
        Self { raw: String::new() }
    }

    /// Interpret raw header bytes as a property bag.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            raw: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Look up a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Set a property, dropping any earlier entry for the same key.
    pub fn set(&mut self, key: &str, value: &str) {
        self.remove(key);
        self.raw.push_str(key);
        self.raw.push('=');
        self.raw.push_str(value);
        self.raw.push(';');
    }

    /// Remove every entry for `key`.
    pub fn remove(&mut self, key: &str) {
        if self.get(key).is_none() {
            return;
        }
        let mut kept = String::with_capacity(self.raw.len());
        for entry in self.raw.split(';').filter(|e| !e.is_empty()) {
            let entry_key = entry.split_once('=').map_or(entry, |(k, _)| k);
            if entry_key != key {
                kept.push_str(entry);
                kept.push(';');
            }
        }
        self.raw = kept;
    }

    /// Copy every property of `other` into this bag.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Iterate over the properties in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw
            .split(';')
            .filter_map(|entry| entry.split_once('='))
    }

    /// Returns `true` if the bag holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// The encoded form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The encoded form as header bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.raw.as_bytes())
    }
}

impl fmt::Display for HeaderBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&[u8]> for HeaderBag {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut bag = HeaderBag::new();
        bag.set("code", "500");
        bag.set("message", "boom");

        assert_eq!(bag.as_str(), "code=500;message=boom;");
        assert_eq!(bag.get("code"), Some("500"));
        assert_eq!(bag.get("message"), Some("boom"));
        assert_eq!(bag.get("missing"), None);
    }

    #[test]
    fn test_set_replaces_then_appends() {
        let mut bag = HeaderBag::from_bytes(b"a=1;b=2;");
        bag.set("a", "3");
        assert_eq!(bag.as_str(), "b=2;a=3;");
    }

    #[test]
    fn test_key_prefix_is_not_a_match() {
        let mut bag = HeaderBag::from_bytes(b"ab=1;");
        assert_eq!(bag.get("a"), None);
        bag.set("a", "2");
        assert_eq!(bag.get("ab"), Some("1"));
        assert_eq!(bag.get("a"), Some("2"));
    }

    #[test]
    fn test_empty_value() {
        let mut bag = HeaderBag::new();
        bag.set("code", "");
        assert_eq!(bag.get("code"), Some(""));
        assert!(!bag.is_empty());
    }

    #[test]
    fn test_merge() {
        let mut bag = HeaderBag::from_bytes(b"a=1;");
        bag.merge(&HeaderBag::from_bytes(b"a=2;c=3;"));
        assert_eq!(bag.as_str(), "a=2;c=3;");
    }

    #[test]
    fn test_garbage_header_is_tolerated() {
        let bag = HeaderBag::from_bytes(&[0xff, b';', b'k', b'=', b'v', b';']);
        assert_eq!(bag.get("k"), Some("v"));
    }
}
