//! The active-state configuration.

use statech_event::SessionId;
use statech_tree::{DocumentId, StateChart, StateKind};
use std::collections::{BTreeSet, HashMap};

/// The set of currently active state nodes of one instance, plus the
/// last-exited member sets remembered for history states.
///
/// Active states are kept in a `BTreeSet` of [`DocumentId`]s, so
/// iteration is document order by construction. The root is implicit
/// and never a member. Mutated exclusively by the step engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    active: BTreeSet<DocumentId>,
    history: HashMap<DocumentId, BTreeSet<DocumentId>>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.active.contains(&id)
    }

    pub fn insert(&mut self, id: DocumentId) {
        self.active.insert(id);
    }

    pub fn remove(&mut self, id: DocumentId) {
        self.active.remove(&id);
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Active states in document order.
    pub fn iter(&self) -> impl Iterator<Item = DocumentId> + '_ {
        self.active.iter().copied()
    }

    /// Active atomic and final states in document order.
    pub fn atomic_states(&self, chart: &StateChart) -> Vec<DocumentId> {
        self.active
            .iter()
            .copied()
            .filter(|id| chart.node(*id).is_atomic())
            .collect()
    }

    /// Remembers the member set for a history state.
    pub fn record_history(&mut self, history: DocumentId, members: BTreeSet<DocumentId>) {
        self.history.insert(history, members);
    }

    pub fn history_of(&self, history: DocumentId) -> Option<&BTreeSet<DocumentId>> {
        self.history.get(&history)
    }

    pub fn history_entries(&self) -> impl Iterator<Item = (DocumentId, &BTreeSet<DocumentId>)> {
        self.history.iter().map(|(k, v)| (*k, v))
    }

    /// Rebuilds a configuration from persisted parts.
    pub fn from_parts(
        active: impl IntoIterator<Item = DocumentId>,
        history: impl IntoIterator<Item = (DocumentId, BTreeSet<DocumentId>)>,
    ) -> Self {
        Self {
            active: active.into_iter().collect(),
            history: history.into_iter().collect(),
        }
    }

    /// Returns true if the state is "in a final state": a compound
    /// state with an active final child, or a parallel state all of
    /// whose regions are in a final state.
    pub fn in_final_state(&self, chart: &StateChart, id: DocumentId) -> bool {
        let node = chart.node(id);
        match node.kind {
            StateKind::Compound { .. } => node
                .state_children(chart)
                .any(|c| chart.node(c).is_final() && self.contains(c)),
            StateKind::Parallel => node
                .state_children(chart)
                .all(|c| self.in_final_state(chart, c)),
            _ => false,
        }
    }

    /// Checks the legal-configuration invariant: every active compound
    /// state (and the root, while the instance runs) has exactly one
    /// active child, every active parallel state has all of its
    /// children active, every active non-top state has its parent
    /// active.
    pub fn validate(&self, chart: &StateChart, session_id: &SessionId) -> Result<(), String> {
        for id in self.iter() {
            let node = chart.node(id);
            if node.is_history() {
                return Err(format!("history state {} active in session {session_id}", id));
            }
            if let Some(parent) = node.parent {
                if parent != chart.root() && !self.contains(parent) {
                    return Err(format!("state {} active without its parent", id));
                }
            }
            match node.kind {
                StateKind::Compound { .. } => {
                    let active_children = node
                        .state_children(chart)
                        .filter(|c| self.contains(*c))
                        .count();
                    if active_children != 1 {
                        return Err(format!(
                            "compound state {} has {} active children",
                            id, active_children
                        ));
                    }
                }
                StateKind::Parallel => {
                    let missing = node
                        .state_children(chart)
                        .filter(|c| !self.contains(*c))
                        .count();
                    if missing != 0 {
                        return Err(format!(
                            "parallel state {} has {} inactive regions",
                            id, missing
                        ));
                    }
                }
                _ => {}
            }
        }

        if !self.is_empty() {
            let root = chart.node(chart.root());
            let active_top = root
                .state_children(chart)
                .filter(|c| self.contains(*c))
                .count();
            if active_top != 1 {
                return Err(format!("{} active top-level states", active_top));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn parallel_chart() -> Arc<StateChart> {
        let def = json!({
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "initial": "a", "states": [{"id": "a"}, {"id": "b"}]},
                    {"id": "r2", "initial": "c", "states": [{"id": "c"}, {"id": "d"}]}
                ]}
            ]
        });
        Arc::new(StateChart::from_json("par", 1, &def).unwrap())
    }

    #[test]
    fn test_document_order_iteration() {
        let chart = parallel_chart();
        let mut config = Configuration::new();
        // Insert out of order.
        config.insert(chart.state_id("c").unwrap());
        config.insert(chart.state_id("p").unwrap());
        config.insert(chart.state_id("a").unwrap());

        let order: Vec<_> = config.iter().collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn test_validate_parallel_needs_all_regions() {
        let chart = parallel_chart();
        let session = SessionId::generate();
        let mut config = Configuration::new();
        for name in ["p", "r1", "a"] {
            config.insert(chart.state_id(name).unwrap());
        }
        assert!(config.validate(&chart, &session).is_err());

        for name in ["r2", "c"] {
            config.insert(chart.state_id(name).unwrap());
        }
        assert!(config.validate(&chart, &session).is_ok());
    }

    #[test]
    fn test_validate_compound_single_child() {
        let chart = parallel_chart();
        let session = SessionId::generate();
        let mut config = Configuration::new();
        for name in ["p", "r1", "a", "b", "r2", "c"] {
            config.insert(chart.state_id(name).unwrap());
        }
        // r1 has two active children.
        assert!(config.validate(&chart, &session).is_err());
    }
}
