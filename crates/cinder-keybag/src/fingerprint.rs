//! Raw key material and its fingerprint.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{KeyBagError, Result};

/// Length of a symmetric key in bytes.
pub const KEY_LEN: usize = 32;

/// Raw symmetric key material.
///
/// `Debug` prints only the fingerprint.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        KeyMaterial(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            KeyBagError::InvalidMaterial(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(KeyMaterial(arr))
    }

    /// Parse a base58btc key string.
    pub fn from_key_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| KeyBagError::InvalidMaterial(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// The base58btc key string, as stored and gossiped.
    pub fn to_key_str(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Deterministic identifier of this material.
    pub fn fingerprint(&self) -> String {
        bs58::encode(Sha256::digest(self.0)).into_string()
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({})", self.fingerprint())
    }
}
