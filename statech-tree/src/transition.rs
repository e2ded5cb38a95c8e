//! Transitions and event descriptor matching.

use crate::action::Action;
use crate::id::DocumentId;
use serde::{Deserialize, Serialize};

/// How the exit/entry domain of a transition is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// Domain is the least common compound ancestor of source and targets.
    #[default]
    External,
    /// Domain is the source itself when every target is a descendant of
    /// it, so the source is not exited.
    Internal,
}

/// One token of a transition's event attribute.
///
/// A descriptor matches on dot-separated name prefixes: `foo` matches
/// `foo` and `foo.bar` but never `foobar`; `*` matches every event.
/// Trailing `.` and `.*` in the definition are normalized away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventDescriptor(String);

impl EventDescriptor {
    pub fn new(token: impl Into<String>) -> Self {
        let mut token: String = token.into();
        if token != "*" {
            if let Some(stripped) = token.strip_suffix(".*") {
                token = stripped.to_string();
            }
            while token.ends_with('.') {
                token.pop();
            }
        }
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix-matches an event name against this descriptor.
    pub fn matches(&self, event_name: &str) -> bool {
        if self.0 == "*" {
            return true;
        }
        match event_name.strip_prefix(self.0.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }
}

/// A transition between state nodes.
#[derive(Debug, Clone)]
pub struct Transition {
    /// The node this transition belongs to.
    pub source: DocumentId,

    /// Event descriptors. Empty means eventless.
    pub events: Vec<EventDescriptor>,

    /// Optional guard expression, opaque to the tree.
    pub cond: Option<String>,

    /// Target nodes. Empty for a targetless transition; more than one
    /// only when targeting parallel regions.
    pub targets: Vec<DocumentId>,

    pub kind: TransitionKind,

    /// Actions run between exit and entry, in document order.
    pub actions: Vec<Action>,
}

impl Transition {
    /// A transition with no event descriptors fires automatically once
    /// its guard is true.
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns true if any descriptor matches the event name.
    pub fn matches_event(&self, event_name: &str) -> bool {
        self.events.iter().any(|d| d.matches(event_name))
    }
}
