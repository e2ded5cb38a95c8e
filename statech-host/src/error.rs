//! Host error types.

use statech_event::SessionId;
use thiserror::Error;

/// Errors from the host scheduler.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("no such session: {0}")]
    SessionNotFound(SessionId),

    #[error("no such chart: {0}")]
    ChartNotFound(String),

    #[error("definition error: {0}")]
    Tree(#[from] statech_tree::TreeError),

    #[error("interpreter error: {0}")]
    Interp(#[from] statech_interp::InterpError),

    #[error("persistence error: {0}")]
    Persist(#[from] statech_persist::PersistError),

    #[error("event delivery failed: {0}")]
    Event(#[from] statech_event::EventError),

    #[error("snapshot persistence is not configured")]
    PersistenceDisabled,

    #[error("instance task panicked")]
    TaskPanicked,
}
