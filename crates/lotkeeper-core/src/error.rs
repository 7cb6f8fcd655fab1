//! Error types for the Lotkeeper core library.

use thiserror::Error;

/// Result type alias using the Lotkeeper core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Lotkeeper operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
