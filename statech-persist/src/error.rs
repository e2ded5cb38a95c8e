//! Persistence error types.

use thiserror::Error;

/// Errors from the snapshot store.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot not found for session: {0}")]
    NotFound(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}
