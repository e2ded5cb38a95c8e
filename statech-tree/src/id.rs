//! Document-order node identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable node identifier assigned in document order at build time.
///
/// The numeric ordering of `DocumentId` is the document order of the
/// tree, so all tie-breaks (transition priority, exit/entry ordering)
/// compare ids directly. Persisted records reference nodes by id, never
/// by pointer, so one tree can back many instances.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DocumentId(pub u32);

impl DocumentId {
    /// The root node of every chart.
    pub const ROOT: DocumentId = DocumentId(0);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into the chart's node arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_document_order() {
        let a = DocumentId(1);
        let b = DocumentId(7);
        assert!(a < b);
        assert_eq!(DocumentId::ROOT.index(), 0);
    }
}
