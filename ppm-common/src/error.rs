//! Common error types for PPM

use thiserror::Error;

/// Common result type for PPM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across PPM services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Malformed entity or observation (rejected at ingestion, skipped at aggregation)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Backing store does not offer the requested capability
    #[error("Unsupported by {backend} store: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}
