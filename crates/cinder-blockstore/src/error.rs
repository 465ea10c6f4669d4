//! Error types for the block store and loader.

use cinder_core::{CoreError, Hash};
use cinder_keybag::KeyBagError;
use thiserror::Error;

/// Failures reported by a physical store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("I/O error on {key}: {message}")]
    Io { key: String, message: String },

    #[error("No gateway registered for scheme: {0}")]
    UnknownScheme(String),

    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

/// Errors raised by transactions, commits, compaction and loading.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Missing block: {0}")]
    MissingBlock(Hash),

    #[error("Stale archive {car}: removed by compaction")]
    StaleArchive {
        car: Hash,
        #[source]
        cause: GatewayError,
    },

    #[error("Archive {expected} failed verification, computed {actual}")]
    ArchiveMismatch { expected: Hash, actual: Hash },

    #[error("Storage error: {0}")]
    Storage(#[from] GatewayError),

    #[error("Key bag error: {0}")]
    KeyBag(#[from] KeyBagError),

    #[error("Encoding error: {0}")]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("use a transaction to put")]
    DirectPut,

    #[error("transaction {0} already has an unshift block")]
    DoubleUnshift(String),

    #[error("Invalid car header: {0}")]
    InvalidHeader(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleArchive { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
