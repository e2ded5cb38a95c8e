//! # statech-host
//!
//! The host scheduler: runs many statechart instances concurrently on
//! the tokio runtime, one task per instance, each suspending only while
//! waiting for its next event.
//!
//! The host owns the chart registry, routes inter-instance sends, and
//! persists instance records according to the configured snapshot
//! policy.

pub mod config;
pub mod error;
pub mod host;

pub use config::{HostConfig, InterpSection, SnapshotSection};
pub use error::HostError;
pub use host::{Host, InstanceReport};
