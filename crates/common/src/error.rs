//! Error types for TestPilot

use thiserror::Error;

/// Result type alias using TestPilot Error
pub type Result<T> = std::result::Result<T, Error>;

/// TestPilot error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid table name: {0:?}")]
    InvalidTableName(String),

    #[error("Operation not supported by {backend} database: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}
