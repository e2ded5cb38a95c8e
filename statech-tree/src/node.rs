//! State node variants.

use crate::action::{Action, InvokeDef};
use crate::id::DocumentId;
use crate::transition::Transition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// History restoration depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    /// Remember the immediate children that were active.
    Shallow,
    /// Remember the full active descendant set.
    Deep,
}

/// Payload computed by a final state and surfaced on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DoneData {
    /// Expression evaluated against the data model at completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,

    /// Literal content used when no expression is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

/// Node variant.
#[derive(Debug, Clone)]
pub enum StateKind {
    /// A state with children; exactly one child is active at a time.
    /// `initial` holds the default-initial target set.
    Compound { initial: Vec<DocumentId> },

    /// A state whose children are all active simultaneously.
    Parallel,

    /// A leaf state.
    Atomic,

    /// A terminal state. Entering a final child of the root completes
    /// the instance.
    Final { done_data: Option<DoneData> },

    /// A pseudo-state restoring the last-exited child set of its parent.
    History { kind: HistoryKind },
}

/// One node of the statechart tree.
///
/// Nodes are exclusively owned by the [`StateChart`](crate::StateChart)
/// arena and referenced everywhere else by [`DocumentId`].
#[derive(Debug, Clone)]
pub struct StateNode {
    /// Document-order id; also the arena index.
    pub id: DocumentId,

    /// State identifier from the definition. Empty for the root.
    pub name: String,

    /// Parent node, `None` for the root.
    pub parent: Option<DocumentId>,

    /// Distance from the root.
    pub depth: u32,

    /// Children in document order. History children included.
    pub children: Vec<DocumentId>,

    /// Node variant.
    pub kind: StateKind,

    /// Actions run when the node is entered.
    pub on_entry: Vec<Action>,

    /// Actions run when the node is exited.
    pub on_exit: Vec<Action>,

    /// Outgoing transitions in document order.
    pub transitions: Vec<Transition>,

    /// Child services started when the node is entered.
    pub invokes: Vec<InvokeDef>,
}

impl StateNode {
    /// Returns true for leaves that can carry the active configuration:
    /// atomic and final states.
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final { .. })
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.kind, StateKind::Compound { .. })
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, StateKind::Parallel)
    }

    pub fn is_final(&self) -> bool {
        matches!(self.kind, StateKind::Final { .. })
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, StateKind::History { .. })
    }

    /// Children that are real states (history pseudo-states excluded).
    pub fn state_children<'a>(
        &'a self,
        chart: &'a crate::StateChart,
    ) -> impl Iterator<Item = DocumentId> + 'a {
        self.children
            .iter()
            .copied()
            .filter(move |c| !chart.node(*c).is_history())
    }
}
