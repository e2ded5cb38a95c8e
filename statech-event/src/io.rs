//! The transport boundary.
//!
//! An [`IoProcessor`] carries events out of the process. The core never
//! parses addresses beyond the reserved `#_` forms; everything else is
//! opaque to it.

use crate::event::Event;
use thiserror::Error;

/// Sentinel target that routes a send onto the internal queue. Never
/// leaves the process and is rejected when combined with a delay.
pub const INTERNAL_TARGET: &str = "#_internal";

/// Prefix addressing a running invoked child.
const INVOKE_TARGET_PREFIX: &str = "#_";

/// Classified send target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// No target: the instance's own external queue.
    SelfExternal,
    /// The `#_internal` sentinel.
    Internal,
    /// `#_<invokeid>`: a running child service.
    Invoke(String),
    /// Anything else: handed to the transport.
    External(String),
}

impl SendTarget {
    pub fn classify(target: Option<&str>) -> Self {
        match target {
            None | Some("") => SendTarget::SelfExternal,
            Some(INTERNAL_TARGET) => SendTarget::Internal,
            Some(t) => match t.strip_prefix(INVOKE_TARGET_PREFIX) {
                Some(invoke_id) if !invoke_id.starts_with("scxml_") => {
                    SendTarget::Invoke(invoke_id.to_string())
                }
                _ => SendTarget::External(t.to_string()),
            },
        }
    }
}

/// An event addressed to a target outside the owning instance.
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    pub target: String,
    pub event: Event,
}

/// What the transport did with an outgoing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// Handed off to the remote side.
    Delivered,
    /// Routed to another in-process instance's queue.
    QueuedInternally,
}

/// Transport errors, surfaced to the sending instance as
/// `error.communication` events.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("unreachable target: {target}")]
    Unreachable { target: String },

    #[error("transport rejected event: {reason}")]
    Rejected { reason: String },
}

/// Outbound transport capability, supplied by the host.
pub trait IoProcessor: Send + Sync {
    fn try_send(&self, outgoing: OutgoingEvent) -> Result<SendDisposition, IoError>;
}

/// Default transport: every external target is unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnreachableIo;

impl IoProcessor for UnreachableIo {
    fn try_send(&self, outgoing: OutgoingEvent) -> Result<SendDisposition, IoError> {
        Err(IoError::Unreachable {
            target: outgoing.target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_targets() {
        assert_eq!(SendTarget::classify(None), SendTarget::SelfExternal);
        assert_eq!(SendTarget::classify(Some("#_internal")), SendTarget::Internal);
        assert_eq!(
            SendTarget::classify(Some("#_inv-7")),
            SendTarget::Invoke("inv-7".to_string())
        );
        assert_eq!(
            SendTarget::classify(Some("#_scxml_abc")),
            SendTarget::External("#_scxml_abc".to_string())
        );
        assert_eq!(
            SendTarget::classify(Some("http://example.com/hook")),
            SendTarget::External("http://example.com/hook".to_string())
        );
    }
}
