use super::PacketPlugin;
use crate::error::{PacketError, Result};
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use bytes::{Bytes, BytesMut};
use std::fmt;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM encryption of header and body.
///
/// Each section is sealed independently as `nonce | ciphertext | tag`. Empty
/// sections stay empty so that bare acknowledgements remain cheap.
#[derive(Clone)]
pub struct Crypt {
    cipher: Aes256Gcm,
}

impl Crypt {
    /// Create the plugin from a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not 32 bytes long.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(PacketError::Plugin(format!(
                "Crypt key must be 32 bytes, got {}",
                key.len()
            )));
        }

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    fn encrypt(&self, data: &Bytes) -> Result<Bytes> {
        if data.is_empty() {
            return Ok(Bytes::new());
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data.as_ref())
            .map_err(|e| PacketError::Plugin(format!("Encryption failed: {e}")))?;

        let mut output = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&ciphertext);
        Ok(output.freeze())
    }

    fn decrypt(&self, data: &Bytes) -> Result<Bytes> {
        if data.is_empty() {
            return Ok(Bytes::new());
        }
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(PacketError::Plugin("Encrypted data too short".to_string()));
        }

        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|e| PacketError::Plugin(format!("Decryption failed: {e}")))?;

        Ok(Bytes::from(plaintext))
    }
}

impl fmt::Debug for Crypt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crypt").finish_non_exhaustive()
    }
}

impl PacketPlugin for Crypt {
    fn on_send(&self, _operator: u32, header: Bytes, body: Bytes) -> Result<(Bytes, Bytes)> {
        Ok((self.encrypt(&header)?, self.encrypt(&body)?))
    }

    fn on_receive(&self, _operator: u32, header: Bytes, body: Bytes) -> Result<(Bytes, Bytes)> {
        Ok((self.decrypt(&header)?, self.decrypt(&body)?))
    }
}
