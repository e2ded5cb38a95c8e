//! The statechart tree arena.

use crate::action::DataDecl;
use crate::builder;
use crate::error::TreeError;
use crate::id::DocumentId;
use crate::node::{StateKind, StateNode};
use serde_json::Value;
use std::collections::HashMap;

/// Validated, immutable statechart tree.
///
/// Nodes live in a flat array indexed by [`DocumentId`] in document
/// order. The chart is built once per definition and shared read-only
/// (behind an `Arc`) across all instances of that definition.
#[derive(Debug, Clone)]
pub struct StateChart {
    /// Definition name.
    pub name: String,

    /// Definition version.
    pub version: u32,

    /// crc32c of the raw definition, used to match persisted records
    /// against the tree they were captured from.
    pub checksum: String,

    /// Top-level data model declarations.
    pub datamodel: Vec<DataDecl>,

    pub(crate) nodes: Vec<StateNode>,
    pub(crate) by_name: HashMap<String, DocumentId>,
    pub(crate) raw: Value,
}

impl StateChart {
    /// Parses and validates a definition from the JSON DSL.
    pub fn from_json(
        name: impl Into<String>,
        version: u32,
        json: &Value,
    ) -> Result<Self, TreeError> {
        builder::build(name.into(), version, json)
    }

    /// The synthetic root node enclosing the top-level states.
    pub fn root(&self) -> DocumentId {
        DocumentId::ROOT
    }

    /// Looks up a node by id. Panics on an id from a different chart;
    /// use [`get`](Self::get) for untrusted ids.
    pub fn node(&self, id: DocumentId) -> &StateNode {
        &self.nodes[id.index()]
    }

    /// Fallible node lookup for ids read from persisted records.
    pub fn get(&self, id: DocumentId) -> Option<&StateNode> {
        self.nodes.get(id.index())
    }

    /// Resolves a state name to its id.
    pub fn state_id(&self, name: &str) -> Option<DocumentId> {
        self.by_name.get(name).copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Proper ancestors of `id`, closest first, root last.
    pub fn ancestors(&self, id: DocumentId) -> impl Iterator<Item = DocumentId> + '_ {
        let mut current = self.node(id).parent;
        std::iter::from_fn(move || {
            let next = current?;
            current = self.node(next).parent;
            Some(next)
        })
    }

    /// Returns true if `a` is a proper descendant of `b`.
    pub fn is_descendant(&self, a: DocumentId, b: DocumentId) -> bool {
        self.ancestors(a).any(|anc| anc == b)
    }

    /// Least common compound ancestor of a set of nodes: the closest
    /// proper ancestor of all of them that is a compound state (the
    /// root counts as compound).
    pub fn lcca(&self, ids: &[DocumentId]) -> DocumentId {
        let first = match ids.first() {
            Some(id) => *id,
            None => return self.root(),
        };
        for anc in self.ancestors(first) {
            if !self.node(anc).is_compound() {
                continue;
            }
            if ids[1..].iter().all(|id| self.is_descendant(*id, anc)) {
                return anc;
            }
        }
        self.root()
    }

    /// Default-initial target set of a node: the declared initial for a
    /// compound state, every child for a parallel state, empty for
    /// leaves.
    pub fn initial_targets(&self, id: DocumentId) -> Vec<DocumentId> {
        let node = self.node(id);
        match &node.kind {
            StateKind::Compound { initial } => initial.clone(),
            StateKind::Parallel => node.state_children(self).collect(),
            _ => Vec::new(),
        }
    }

    /// Returns the raw definition as JSON.
    pub fn to_json(&self) -> Value {
        self.raw.clone()
    }
}
