//! Error types for the meta merger.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MergerError {
    /// Relational store failure, passed through untouched.
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Stored meta is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MergerError>;
