//! Tree construction errors.

use thiserror::Error;

/// Errors from parsing and validating a statechart definition.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("duplicate state id: {name}")]
    DuplicateState { name: String },

    #[error("unknown state id: {name}")]
    UnknownState { name: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TreeError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            reason: reason.into(),
        }
    }
}
