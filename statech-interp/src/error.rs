//! Interpreter error types.
//!
//! Only programmer-error-class failures surface here: a malformed
//! machine, a broken guard expression, a persisted record that does
//! not match its tree. Recoverable statechart errors travel as
//! `error.execution` / `error.communication` events through the
//! internal queue instead.

use thiserror::Error;

/// Fatal errors from the interpreter.
#[derive(Debug, Error)]
pub enum InterpError {
    /// The eventless-transition loop did not reach quiescence within
    /// the configured iteration cap.
    #[error("malformed machine: {reason}")]
    MalformedMachine { reason: String },

    /// The configuration violates the legal-configuration invariant.
    #[error("illegal configuration: {reason}")]
    IllegalConfiguration { reason: String },

    /// Guard evaluation infrastructure failed; the macrostep is aborted.
    #[error("guard evaluation failed for '{expr}': {reason}")]
    GuardEvaluation { expr: String, reason: String },

    /// Data model initialization or restore failed.
    #[error("data model failure: {reason}")]
    DataModel { reason: String },

    /// A persisted record does not belong to the supplied tree.
    #[error("record does not match tree: {reason}")]
    RecordMismatch { reason: String },

    /// Capturing a snapshot failed.
    #[error("snapshot failed: {reason}")]
    SnapshotFailed { reason: String },
}

impl InterpError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            InterpError::MalformedMachine { .. } => "MALFORMED_MACHINE",
            InterpError::IllegalConfiguration { .. } => "ILLEGAL_CONFIGURATION",
            InterpError::GuardEvaluation { .. } => "GUARD_EVAL_FAILED",
            InterpError::DataModel { .. } => "DATA_MODEL_FAILURE",
            InterpError::RecordMismatch { .. } => "RECORD_MISMATCH",
            InterpError::SnapshotFailed { .. } => "SNAPSHOT_FAILED",
        }
    }
}
