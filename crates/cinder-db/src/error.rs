//! Error types for the ledger layer.

use cinder_blockstore::{GatewayError, StoreError};
use cinder_clock::ClockError;
use cinder_core::CoreError;
use cinder_keybag::KeyBagError;
use cinder_merger::MergerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Clock error: {0}")]
    Clock(ClockError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Key bag error: {0}")]
    KeyBag(#[from] KeyBagError),

    #[error("Meta codec error: {0}")]
    Codec(#[from] CoreError),

    #[error("Merger error: {0}")]
    Merger(#[from] MergerError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ClockError> for DbError {
    fn from(e: ClockError) -> Self {
        match e {
            ClockError::NotFound(id) => DbError::DocumentNotFound(id),
            other => DbError::Clock(other),
        }
    }
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::DocumentNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
