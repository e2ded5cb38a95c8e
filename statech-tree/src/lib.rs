//! # statech-tree
//!
//! Immutable statechart tree model for statech.
//!
//! This crate provides:
//! - The flat, document-ordered state node arena ([`StateChart`])
//! - Node variants (compound, parallel, atomic, final, history)
//! - Transitions with event descriptors and guard expressions
//! - Executable content declarations
//! - JSON DSL parsing and validation
//!
//! A [`StateChart`] is built once per definition and shared read-only
//! across every running instance of that definition.

pub mod action;
pub mod builder;
pub mod chart;
pub mod error;
pub mod id;
pub mod node;
pub mod transition;

pub use action::{Action, DataDecl, InvokeDef, SendParams};
pub use chart::StateChart;
pub use error::TreeError;
pub use id::DocumentId;
pub use node::{DoneData, HistoryKind, StateKind, StateNode};
pub use transition::{EventDescriptor, Transition, TransitionKind};
