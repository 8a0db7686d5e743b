//! Error types for broker, storage, and codec operations

use thiserror::Error;

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors that can occur in broker, storage, and codec adapters
///
/// Infrastructure failures (`Unavailable`) are recoverable: callers retry
/// with backoff and never record them against a call. The remaining variants
/// indicate programming or data errors.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Backend cannot be reached
    #[error("Adapter unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// Record or queue entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Compare-and-swap lost or duplicate insert
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Completion subscriber fell behind and missed events
    #[error("Completion stream lagged by {0} events")]
    Lagged(u64),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}
