//! Block payload sealing.
//!
//! Sealed layout:
//!
//! ```text
//! [version = 1][fpr_len: u8][fingerprint bytes][nonce: 24][ciphertext]
//! ```
//!
//! The block address is bound as associated data, so a sealed payload
//! cannot be replayed under another address.

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use cinder_core::Hash;
use rand::RngCore;
use std::sync::Arc;

use crate::error::{KeyBagError, Result};
use crate::keybag::KeysByFingerprint;

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 24;

/// How a store treats block payloads on their way to and from storage.
#[derive(Clone, Debug)]
pub enum BlockCrypto {
    /// Payloads are stored as plaintext (`storekey=insecure`).
    Insecure,
    /// Payloads are sealed with the default key of the named set.
    Keyed(Arc<KeysByFingerprint>),
}

impl BlockCrypto {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, BlockCrypto::Keyed(_))
    }

    /// Seal a block payload for storage.
    pub fn encrypt(&self, address: &Hash, plain: &[u8]) -> Result<Vec<u8>> {
        let keys = match self {
            BlockCrypto::Insecure => return Ok(plain.to_vec()),
            BlockCrypto::Keyed(keys) => keys,
        };
        let key = keys.default_key()?;
        let fpr = key.fingerprint.as_bytes();
        let fpr_len = u8::try_from(fpr.len())
            .map_err(|_| KeyBagError::Envelope("fingerprint too long".into()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let aead = XChaCha20Poly1305::new(Key::from_slice(key.material.as_bytes()));
        let ct = aead
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plain,
                    aad: address.as_bytes(),
                },
            )
            .map_err(|e| KeyBagError::Encrypt(format!("{:?}", e)))?;

        let mut out = Vec::with_capacity(2 + fpr.len() + NONCE_LEN + ct.len());
        out.push(ENVELOPE_VERSION);
        out.push(fpr_len);
        out.extend_from_slice(fpr);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Open a sealed payload using the key its fingerprint names.
    pub fn decrypt(&self, address: &Hash, sealed: &[u8]) -> Result<Vec<u8>> {
        let keys = match self {
            BlockCrypto::Insecure => return Ok(sealed.to_vec()),
            BlockCrypto::Keyed(keys) => keys,
        };
        let (fingerprint, nonce, ct) = split_envelope(sealed)?;
        let key = keys
            .get(Some(fingerprint))
            .ok_or_else(|| KeyBagError::MissingKey {
                name: keys.name().to_string(),
                fingerprint: fingerprint.to_string(),
            })?;
        let aead = XChaCha20Poly1305::new(Key::from_slice(key.material.as_bytes()));
        aead.decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ct,
                aad: address.as_bytes(),
            },
        )
        .map_err(|e| KeyBagError::Decrypt(format!("{:?}", e)))
    }
}

fn split_envelope(sealed: &[u8]) -> Result<(&str, &[u8], &[u8])> {
    if sealed.len() < 2 {
        return Err(KeyBagError::Envelope("truncated".into()));
    }
    if sealed[0] != ENVELOPE_VERSION {
        return Err(KeyBagError::Envelope(format!(
            "unsupported version {}",
            sealed[0]
        )));
    }
    let fpr_end = 2 + sealed[1] as usize;
    let nonce_end = fpr_end + NONCE_LEN;
    if sealed.len() < nonce_end {
        return Err(KeyBagError::Envelope("truncated".into()));
    }
    let fingerprint = std::str::from_utf8(&sealed[2..fpr_end])
        .map_err(|e| KeyBagError::Envelope(e.to_string()))?;
    Ok((fingerprint, &sealed[fpr_end..nonce_end], &sealed[nonce_end..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyBag, KeyMaterial};
    use cinder_core::Hasher;

    async fn keyed(name: &str) -> (KeyBag, BlockCrypto) {
        let bag = KeyBag::memory();
        let set = bag.get_named_key(name, false, None).await.unwrap();
        (bag, BlockCrypto::Keyed(set))
    }

    #[tokio::test]
    async fn test_seal_open() {
        let (_bag, crypto) = keyed("k").await;
        let addr = Hasher::hash(b"doc");
        let sealed = crypto.encrypt(&addr, b"doc").unwrap();
        assert_ne!(&sealed[..], b"doc");
        assert_eq!(crypto.decrypt(&addr, &sealed).unwrap(), b"doc".to_vec());
    }

    #[tokio::test]
    async fn test_wrong_address_fails() {
        let (_bag, crypto) = keyed("k").await;
        let sealed = crypto.encrypt(&Hasher::hash(b"a"), b"a").unwrap();
        let err = crypto.decrypt(&Hasher::hash(b"b"), &sealed).unwrap_err();
        assert!(matches!(err, KeyBagError::Decrypt(_)));
    }

    #[tokio::test]
    async fn test_unknown_fingerprint_is_missing_key() {
        let (_a, writer) = keyed("k").await;
        let (_b, reader) = keyed("k").await;
        let addr = Hasher::hash(b"x");
        let sealed = writer.encrypt(&addr, b"x").unwrap();
        let err = reader.decrypt(&addr, &sealed).unwrap_err();
        assert!(matches!(err, KeyBagError::MissingKey { .. }));
    }

    #[tokio::test]
    async fn test_gossiped_key_opens_foreign_payload() {
        let (_a, writer) = keyed("k").await;
        let BlockCrypto::Keyed(writer_keys) = &writer else {
            panic!("expected keyed crypto");
        };
        let addr = Hasher::hash(b"x");
        let sealed = writer.encrypt(&addr, b"x").unwrap();

        let (_b, reader) = keyed("k").await;
        let BlockCrypto::Keyed(reader_keys) = &reader else {
            panic!("expected keyed crypto");
        };
        for key in writer_keys.key_strings() {
            reader_keys.upsert_str(&key, false).await.unwrap();
        }
        assert_eq!(reader.decrypt(&addr, &sealed).unwrap(), b"x".to_vec());
        // the reader's own default is unchanged
        assert_ne!(
            reader_keys.default_key().unwrap().fingerprint,
            KeyMaterial::from_key_str(&writer_keys.key_strings()[0])
                .unwrap()
                .fingerprint()
        );
    }

    #[test]
    fn test_insecure_passthrough() {
        let addr = Hasher::hash(b"p");
        let crypto = BlockCrypto::Insecure;
        assert!(!crypto.is_encrypted());
        assert_eq!(crypto.encrypt(&addr, b"p").unwrap(), b"p".to_vec());
    }
}
