//! Queue errors.

use thiserror::Error;

/// Errors from event queue operations.
#[derive(Debug, Error)]
pub enum EventError {
    /// The receiving instance is gone; its queue can no longer accept
    /// events.
    #[error("event queue closed")]
    QueueClosed,
}
