//! Error types for Robin

use thiserror::Error;

/// Result type for Robin operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type shared by the core data model and configuration layer
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected input: bad ID, unknown mode, missing selector, overlapping rewrite fields
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing ID
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate ID on creation
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// Configuration error (missing/invalid flags)
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
