//! Persistable instance records.
//!
//! An [`InstanceRecord`] is the full logical state of a stopped
//! instance: active configuration, history memory, pending delayed
//! sends, live invokes, and the serialized data model. Resuming from
//! a record on a chart with a different checksum is rejected.

use serde::{Deserialize, Serialize};
use statech_event::{InvokeId, PendingSendRecord, SessionId};
use statech_tree::DocumentId;

/// Remembered configuration of one history state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    /// The history pseudo-state.
    pub history: DocumentId,

    /// Remembered members in document order.
    pub members: Vec<DocumentId>,
}

/// One live invocation, enough to restart the child on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeSnapshot {
    pub invoke_id: InvokeId,
    pub type_uri: String,
    pub autoforward: bool,
    pub payload: serde_json::Value,
    pub owner: DocumentId,
}

/// Complete captured state of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub chart_name: String,
    pub chart_version: u32,

    /// Checksum of the chart definition this record was captured
    /// against. Resume validates it before touching anything else.
    pub chart_checksum: String,

    pub session_id: SessionId,

    /// Serialized [`crate::InterpreterStatus`].
    pub status: String,

    /// Active configuration in document order.
    pub active: Vec<DocumentId>,

    pub history: Vec<HistoryRecord>,

    /// Delayed sends with their remaining delays at capture time.
    pub pending_sends: Vec<PendingSendRecord>,

    pub invokes: Vec<InvokeSnapshot>,

    /// Data model snapshot, opaque to everything but the handler that
    /// produced it.
    pub datamodel: Vec<u8>,

    /// Capture time, unix milliseconds.
    pub captured_at: i64,
}

impl InstanceRecord {
    pub fn captured_now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
