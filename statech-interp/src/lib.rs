//! # statech-interp
//!
//! The statechart interpreter engine:
//! - The step algorithm: transition selection, exit/entry ordering,
//!   the microstep/macrostep loop ([`Interpreter`])
//! - The active-state [`Configuration`]
//! - The pluggable [`DataModelHandler`] contract and the built-in JSON
//!   data model with its small expression language
//! - The [`InvokeCoordinator`] for externally running child services
//! - Snapshot records that make an instance resumable
//!
//! One instance is one logical thread of control: the interpreter is
//! never re-entrant for the same instance, and all asynchronous
//! producers reach it through its external event queue.

pub mod configuration;
pub mod datamodel;
pub mod engine;
pub mod error;
pub mod expr;
pub mod invoke;
pub mod snapshot;

pub use configuration::Configuration;
pub use datamodel::{DataModelError, DataModelHandler, EvalContext, JsonDataModel};
pub use engine::{DoneEvent, Interpreter, InterpreterConfig, InterpreterStatus, MacrostepOutcome};
pub use error::InterpError;
pub use invoke::{
    InvokeCoordinator, InvokeEmitter, NullServiceFactory, ServiceError, ServiceFactory,
    ServiceHandle, ServiceRequest,
};
pub use snapshot::{HistoryRecord, InstanceRecord, InvokeSnapshot};
