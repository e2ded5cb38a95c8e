//! # statech-persist
//!
//! Durable snapshot storage for statech instances.
//!
//! Each session's latest [`InstanceRecord`](statech_interp::InstanceRecord)
//! is written as a JSON file with a crc32c checksum kept in a sidecar
//! index; loading verifies the checksum before deserializing, so a
//! truncated or tampered record surfaces as a typed corruption error
//! rather than a half-restored instance.

pub mod error;
pub mod store;

pub use error::PersistError;
pub use store::{SnapshotMeta, SnapshotPolicy, SnapshotStore};
