//! Error types for the key bag.

use thiserror::Error;

/// Errors raised by key lookup, persistence or block sealing.
#[derive(Error, Debug)]
pub enum KeyBagError {
    #[error("Fingerprint mismatch: stored {stored}, computed {computed}")]
    FingerprintMismatch { stored: String, computed: String },

    #[error("Missing key {fingerprint} in key set {name}")]
    MissingKey { name: String, fingerprint: String },

    #[error("Key set not found: {0}")]
    NotFound(String),

    #[error("Invalid key material: {0}")]
    InvalidMaterial(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Invalid envelope: {0}")]
    Envelope(String),

    #[error("Key bag storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KeyBagError>;
