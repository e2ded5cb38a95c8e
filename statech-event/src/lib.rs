//! # statech-event
//!
//! Event plumbing for statech instances:
//! - Event value types and the platform error event vocabulary
//! - Session, send and invoke identifiers
//! - The per-instance queue pair: internal FIFO plus external
//!   asynchronous queue with delayed, cancelable sends
//! - The transport ("IoProcessor") boundary for events that leave the
//!   process

pub mod error;
pub mod event;
pub mod ids;
pub mod io;
pub mod queue;

pub use error::EventError;
pub use event::{Event, EventKind};
pub use ids::{InvokeId, SendId, SessionId};
pub use io::{
    IoError, IoProcessor, OutgoingEvent, SendDisposition, SendTarget, UnreachableIo,
    INTERNAL_TARGET,
};
pub use queue::{EnqueueHandle, EventQueueSet, PendingSendRecord};
