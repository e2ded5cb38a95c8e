//! Executable content declarations.
//!
//! Actions are static descriptions parsed from the definition; the
//! interpreter executes them against its data model and queues. All
//! expressions are opaque strings evaluated by the pluggable data
//! model handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters of a send action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendParams {
    /// Event name to deliver.
    pub event: String,

    /// Delivery target. `None` targets the owning instance's external
    /// queue; `#_internal` targets the internal queue; `#_<invokeid>`
    /// targets a running child; anything else goes to the transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Delivery delay in milliseconds. Zero means immediate.
    #[serde(default)]
    pub delay_ms: u64,

    /// Explicit send id for later cancellation. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Expression producing the event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// One executable action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Enqueue an internal event.
    Raise { event: String },

    /// Send an event to a target, possibly delayed.
    Send(SendParams),

    /// Cancel a still-pending delayed send by id (literal or expression).
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sendid_expr: Option<String>,
    },

    /// Assign an evaluated expression to a data model location.
    Assign { location: String, expr: String },

    /// Emit a diagnostic log line.
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
    },
}

/// Declaration of an externally invoked child service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeDef {
    /// Service type URI, dispatched by the host's service factory.
    #[serde(rename = "type")]
    pub type_uri: String,

    /// Explicit invoke id. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Expression producing the start payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Mirror every external event delivered to the parent into the child.
    #[serde(default)]
    pub autoforward: bool,
}

/// One data model declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDecl {
    /// Location in the data model.
    pub id: String,

    /// Literal initial value.
    #[serde(default)]
    pub value: Value,
}
