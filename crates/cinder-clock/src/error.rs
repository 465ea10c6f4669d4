//! Error types for the clock.

use cinder_blockstore::StoreError;
use cinder_core::{CoreError, Hash};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClockError {
    /// The key has no visible value. An absence signal, not a fault.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing block: {0}")]
    MissingBlock(Hash),

    #[error("Bulk update contains no operations")]
    EmptyBatch,

    #[error("Update for {0} carries neither a value nor a delete marker")]
    MissingValue(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Encoding error: {0}")]
    Core(#[from] CoreError),
}

impl From<StoreError> for ClockError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MissingBlock(address) => ClockError::MissingBlock(address),
            other => ClockError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClockError>;
