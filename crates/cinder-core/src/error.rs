//! Error types for core encodings.

use crate::hash::Hash;
use thiserror::Error;

/// Errors raised while encoding, decoding or verifying blocks and archives.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Failed to parse: {0}")]
    Parsing(String),

    #[error("Invalid archive: {0}")]
    InvalidFile(String),

    #[error("Length-delimited section too large: {0} bytes")]
    LdReadTooLarge(usize),

    #[error("Entry {address} too large for an archive: {len} bytes")]
    EntryTooLarge { address: Hash, len: usize },

    #[error("Address mismatch: expected {expected}, computed {actual}")]
    AddressMismatch { expected: Hash, actual: Hash },

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
