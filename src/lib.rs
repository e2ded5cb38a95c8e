//! statech - Hierarchical Statechart Execution Engine
//!
//! Event-driven statechart interpretation with compound and parallel
//! states, history, delayed sends, invoked child services, and
//! snapshot-based persistence of running instances.
//!
//! This crate re-exports the workspace members under one roof:
//! - [`tree`]: the static chart definition (states, transitions,
//!   actions) and the JSON definition DSL
//! - [`event`]: events, identifiers, the per-instance queue pair, and
//!   the outbound transport boundary
//! - [`interp`]: the step algorithm, data model, invoke coordination,
//!   and resumable instance records
//! - [`persist`]: the on-disk snapshot store
//! - [`host`]: the multi-instance scheduler that runs interpreters on
//!   tokio tasks
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use statech::host::{Host, HostConfig};
//! use statech::interp::NullServiceFactory;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let host = Host::new(HostConfig::default(), Arc::new(NullServiceFactory))?;
//! host.register_chart("toggle", 1, &json!({
//!     "states": [
//!         {"id": "off", "transitions": [{"event": "flip", "target": "on"}]},
//!         {"id": "on", "transitions": [{"event": "flip", "target": "off"}]}
//!     ]
//! }))?;
//! let session = host.spawn("toggle")?;
//! host.dispatch(&session, statech::event::Event::external("flip", json!(null)))?;
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub use statech_event as event;
pub use statech_host as host;
pub use statech_interp as interp;
pub use statech_persist as persist;
pub use statech_tree as tree;

pub use statech_event::{Event, EventKind, InvokeId, SendId, SessionId};
pub use statech_host::{Host, HostConfig, HostError, InstanceReport};
pub use statech_interp::{
    Interpreter, InterpreterConfig, InterpreterStatus, ServiceFactory, ServiceHandle,
};
pub use statech_persist::{SnapshotPolicy, SnapshotStore};
pub use statech_tree::{StateChart, TreeError};
