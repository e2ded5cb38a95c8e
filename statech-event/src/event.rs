//! Event value types.

use crate::ids::{InvokeId, SendId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Raised by the platform itself (errors, done notifications).
    Platform,
    /// Raised by executable content inside the instance.
    Internal,
    /// Delivered from outside the instance.
    External,
}

/// An event as queued and matched against transitions.
///
/// Immutable once queued; hierarchical dot-separated names drive
/// descriptor prefix matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,

    pub kind: EventKind,

    /// Dynamically-typed payload.
    #[serde(default)]
    pub data: Value,

    /// Id of the send that produced this event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<SendId>,

    /// Origin address of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Io processor type of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_type: Option<String>,

    /// Set when the event was emitted by an invoked child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<InvokeId>,
}

impl Event {
    fn new(name: impl Into<String>, kind: EventKind, data: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            data,
            send_id: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
        }
    }

    pub fn external(name: impl Into<String>, data: Value) -> Self {
        Self::new(name, EventKind::External, data)
    }

    pub fn internal(name: impl Into<String>, data: Value) -> Self {
        Self::new(name, EventKind::Internal, data)
    }

    pub fn platform(name: impl Into<String>, data: Value) -> Self {
        Self::new(name, EventKind::Platform, data)
    }

    /// Recoverable failure of executable content or expressions.
    pub fn error_execution(reason: impl Into<String>) -> Self {
        Self::platform("error.execution", json!({ "reason": reason.into() }))
    }

    /// Recoverable failure of a send, forward or invoke start.
    pub fn error_communication(reason: impl Into<String>) -> Self {
        Self::platform("error.communication", json!({ "reason": reason.into() }))
    }

    /// Raised when a final child of a compound state is entered.
    pub fn done_state(state_name: &str, data: Value) -> Self {
        Self::platform(format!("done.state.{state_name}"), data)
    }

    /// Raised on the parent when an invoked child completes.
    pub fn done_invoke(invoke_id: &InvokeId, data: Value) -> Self {
        let mut event = Self::platform(format!("done.invoke.{invoke_id}"), data);
        event.invoke_id = Some(invoke_id.clone());
        event
    }

    pub fn with_send_id(mut self, send_id: SendId) -> Self {
        self.send_id = Some(send_id);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_invoke_id(mut self, invoke_id: InvokeId) -> Self {
        self.invoke_id = Some(invoke_id);
        self
    }

    pub fn is_error(&self) -> bool {
        self.name == "error" || self.name.starts_with("error.")
    }
}
