//! # cinder-keybag
//!
//! Fingerprint-indexed storage of symmetric keys and the block encryption
//! codec built on top of it.
//!
//! ## Architecture
//!
//! - [`KeyMaterial`]: 32 bytes of raw key material, rendered as a base58 key
//!   string and identified by a fingerprint (base58 of its SHA-256)
//! - [`KeyBag`]: resolves named key sets, creating them with fresh default
//!   material on first use and persisting them through a [`KeyBagProvider`]
//! - [`KeysByFingerprint`]: one named set; at most one default key
//! - [`BlockCrypto`]: seals block payloads with the default key and opens
//!   them with whichever key the envelope's fingerprint names
//!
//! Keys received from peers are upserted as non-default entries, which is
//! how one peer learns to read data written by another.

mod crypto;
mod error;
mod fingerprint;
mod keybag;

pub use crypto::BlockCrypto;
pub use error::{KeyBagError, Result};
pub use fingerprint::KeyMaterial;
pub use keybag::{
    KeyBag, KeyBagProvider, KeyUpsertResult, KeyWithFingerprint, KeysByFingerprint,
    MemoryKeyBagProvider, StoredKey, StoredKeySet,
};
