//! Definition DSL parsing and tree construction.
//!
//! Definitions use a nested JSON DSL:
//!
//! ```json
//! {
//!   "initial": "operating",
//!   "datamodel": {"count": 0},
//!   "states": [
//!     {"id": "operating", "initial": "idle", "states": [
//!       {"id": "idle", "transitions": [
//!         {"event": "tick", "target": "busy", "cond": "ctx.count < 3",
//!          "actions": [{"assign": {"location": "count", "expr": "ctx.count + 1"}}]}
//!       ]},
//!       {"id": "busy"},
//!       {"id": "mem", "type": "history", "history": "deep",
//!        "transitions": [{"target": "idle"}]}
//!     ]},
//!     {"id": "done", "type": "final", "donedata": {"expr": "ctx.count"}}
//!   ]
//! }
//! ```
//!
//! Building assigns [`DocumentId`]s in pre-order (document order), then
//! resolves names to ids and validates the structural rules.

use crate::action::{Action, DataDecl, InvokeDef};
use crate::chart::StateChart;
use crate::error::TreeError;
use crate::id::DocumentId;
use crate::node::{DoneData, HistoryKind, StateKind, StateNode};
use crate::transition::{EventDescriptor, Transition, TransitionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A string or an array of strings.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub(crate) struct StringList(pub Vec<String>);

impl<'de> Deserialize<'de> for StringList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};
        use std::fmt;

        struct StringListVisitor;

        impl<'de> Visitor<'de> for StringListVisitor {
            type Value = StringList;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or array of strings")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(StringList(vec![v.to_string()]))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(s) = seq.next_element::<String>()? {
                    items.push(s);
                }
                Ok(StringList(items))
            }
        }

        deserializer.deserialize_any(StringListVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChartRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initial: Option<StringList>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    datamodel: serde_json::Map<String, Value>,

    states: Vec<StateRaw>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StateRaw {
    id: String,

    /// "compound" | "parallel" | "final" | "history". Inferred from the
    /// shape when absent.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    initial: Option<StringList>,

    /// "shallow" | "deep" for history states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    history: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    donedata: Option<DoneData>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    onentry: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    onexit: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    transitions: Vec<TransitionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    states: Vec<StateRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    invoke: Vec<InvokeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TransitionRaw {
    /// Space-separated event descriptors. Absent means eventless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    cond: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<StringList>,

    /// "internal" | "external" (default).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    actions: Vec<Action>,
}

pub(crate) fn build(name: String, version: u32, json: &Value) -> Result<StateChart, TreeError> {
    let raw: ChartRaw = serde_json::from_value(json.clone())?;

    if raw.states.is_empty() {
        return Err(TreeError::invalid("definition has no states"));
    }

    let mut builder = Builder {
        nodes: Vec::new(),
        by_name: HashMap::new(),
        raws: Vec::new(),
    };

    // Synthetic root enclosing the top-level states.
    builder.nodes.push(StateNode {
        id: DocumentId::ROOT,
        name: String::new(),
        parent: None,
        depth: 0,
        children: Vec::new(),
        kind: StateKind::Compound {
            initial: Vec::new(),
        },
        on_entry: Vec::new(),
        on_exit: Vec::new(),
        transitions: Vec::new(),
        invokes: Vec::new(),
    });

    for state in &raw.states {
        builder.alloc(state, DocumentId::ROOT, 1)?;
    }

    builder.resolve()?;
    builder.resolve_root_initial(raw.initial.as_ref())?;

    let datamodel = raw
        .datamodel
        .iter()
        .map(|(id, value)| DataDecl {
            id: id.clone(),
            value: value.clone(),
        })
        .collect();

    let checksum = format!("{:08x}", crc32c::crc32c(&serde_json::to_vec(&raw)?));

    Ok(StateChart {
        name,
        version,
        checksum,
        datamodel,
        nodes: builder.nodes,
        by_name: builder.by_name,
        raw: json.clone(),
    })
}

struct Builder<'a> {
    nodes: Vec<StateNode>,
    by_name: HashMap<String, DocumentId>,
    raws: Vec<(DocumentId, &'a StateRaw)>,
}

impl<'a> Builder<'a> {
    /// Pre-order allocation pass: assigns ids, links parents and
    /// children, records raws for the resolution pass.
    fn alloc(
        &mut self,
        raw: &'a StateRaw,
        parent: DocumentId,
        depth: u32,
    ) -> Result<DocumentId, TreeError> {
        if raw.id.is_empty() {
            return Err(TreeError::invalid("state with empty id"));
        }
        let id = DocumentId(self.nodes.len() as u32);
        if self.by_name.insert(raw.id.clone(), id).is_some() {
            return Err(TreeError::DuplicateState {
                name: raw.id.clone(),
            });
        }

        let kind = self.initial_kind(raw)?;
        self.nodes.push(StateNode {
            id,
            name: raw.id.clone(),
            parent: Some(parent),
            depth,
            children: Vec::new(),
            kind,
            on_entry: raw.onentry.clone(),
            on_exit: raw.onexit.clone(),
            transitions: Vec::new(),
            invokes: raw.invoke.clone(),
        });
        self.nodes[parent.index()].children.push(id);
        self.raws.push((id, raw));

        for child in &raw.states {
            self.alloc(child, id, depth + 1)?;
        }
        Ok(id)
    }

    /// Maps the raw type declaration onto a node kind. Compound initial
    /// targets stay unresolved until the second pass.
    fn initial_kind(&self, raw: &'a StateRaw) -> Result<StateKind, TreeError> {
        let declared = raw.kind.as_deref();
        match declared {
            Some("parallel") => Ok(StateKind::Parallel),
            Some("final") => Ok(StateKind::Final {
                done_data: raw.donedata.clone(),
            }),
            Some("history") => Ok(StateKind::History {
                kind: parse_history_kind(raw)?,
            }),
            Some("compound") | Some("state") => Ok(StateKind::Compound {
                initial: Vec::new(),
            }),
            Some(other) => Err(TreeError::invalid(format!(
                "unknown state type '{}' on '{}'",
                other, raw.id
            ))),
            None if raw.history.is_some() => Ok(StateKind::History {
                kind: parse_history_kind(raw)?,
            }),
            None if !raw.states.is_empty() => Ok(StateKind::Compound {
                initial: Vec::new(),
            }),
            None => Ok(StateKind::Atomic),
        }
    }

    /// Resolution pass: names to ids, structural validation.
    fn resolve(&mut self) -> Result<(), TreeError> {
        for idx in 0..self.raws.len() {
            let (id, raw) = self.raws[idx];
            self.resolve_kind(id, raw)?;
            self.resolve_transitions(id, raw)?;
        }
        Ok(())
    }

    fn resolve_kind(&mut self, id: DocumentId, raw: &StateRaw) -> Result<(), TreeError> {
        match self.nodes[id.index()].kind.clone() {
            StateKind::Compound { .. } => {
                let initial = self.resolve_initial(id, raw)?;
                self.nodes[id.index()].kind = StateKind::Compound { initial };
            }
            StateKind::Parallel => {
                let regions = self.state_children(id).count();
                if regions == 0 {
                    return Err(TreeError::invalid(format!(
                        "parallel state '{}' has no child states",
                        raw.id
                    )));
                }
            }
            StateKind::Final { .. } => {
                if !raw.states.is_empty() || !raw.transitions.is_empty() || !raw.invoke.is_empty() {
                    return Err(TreeError::invalid(format!(
                        "final state '{}' cannot have children, transitions or invokes",
                        raw.id
                    )));
                }
            }
            StateKind::History { .. } => {
                if !raw.states.is_empty() {
                    return Err(TreeError::invalid(format!(
                        "history state '{}' cannot have children",
                        raw.id
                    )));
                }
                let parent = self.nodes[id.index()].parent.unwrap_or(DocumentId::ROOT);
                let parent_node = &self.nodes[parent.index()];
                if !matches!(
                    parent_node.kind,
                    StateKind::Compound { .. } | StateKind::Parallel
                ) || parent == DocumentId::ROOT
                {
                    return Err(TreeError::invalid(format!(
                        "history state '{}' must be a child of a compound or parallel state",
                        raw.id
                    )));
                }
                if raw.transitions.len() > 1 {
                    return Err(TreeError::invalid(format!(
                        "history state '{}' has more than one default transition",
                        raw.id
                    )));
                }
                if let Some(t) = raw.transitions.first() {
                    if t.event.is_some() || t.cond.is_some() || t.target.is_none() {
                        return Err(TreeError::invalid(format!(
                            "default transition of history state '{}' must be eventless, \
                             unconditioned and targeted",
                            raw.id
                        )));
                    }
                }
            }
            StateKind::Atomic => {
                if raw.donedata.is_some() {
                    return Err(TreeError::invalid(format!(
                        "donedata on non-final state '{}'",
                        raw.id
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve_initial(
        &self,
        id: DocumentId,
        raw: &StateRaw,
    ) -> Result<Vec<DocumentId>, TreeError> {
        if let Some(names) = &raw.initial {
            let mut targets = Vec::new();
            for name in &names.0 {
                let target = self.lookup(name)?;
                if !self.is_descendant(target, id) {
                    return Err(TreeError::invalid(format!(
                        "initial target '{}' is not a descendant of '{}'",
                        name, raw.id
                    )));
                }
                targets.push(target);
            }
            Ok(targets)
        } else {
            // First non-history child is the default.
            self.state_children(id)
                .next()
                .map(|c| vec![c])
                .ok_or_else(|| {
                    TreeError::invalid(format!("compound state '{}' has no child states", raw.id))
                })
        }
    }

    fn resolve_root_initial(&mut self, initial: Option<&StringList>) -> Result<(), TreeError> {
        let targets = if let Some(names) = initial {
            let mut targets = Vec::new();
            for name in &names.0 {
                targets.push(self.lookup(name)?);
            }
            targets
        } else {
            vec![self
                .state_children(DocumentId::ROOT)
                .next()
                .ok_or_else(|| TreeError::invalid("definition has no entrant state"))?]
        };
        self.nodes[DocumentId::ROOT.index()].kind = StateKind::Compound { initial: targets };
        Ok(())
    }

    fn resolve_transitions(&mut self, id: DocumentId, raw: &StateRaw) -> Result<(), TreeError> {
        let mut transitions = Vec::with_capacity(raw.transitions.len());
        for t in &raw.transitions {
            let events: Vec<EventDescriptor> = t
                .event
                .as_deref()
                .unwrap_or("")
                .split_whitespace()
                .map(EventDescriptor::new)
                .collect();

            let mut targets = Vec::new();
            if let Some(names) = &t.target {
                for name in &names.0 {
                    targets.push(self.lookup(name)?);
                }
            }

            if events.is_empty() && t.cond.is_none() && targets.is_empty() {
                return Err(TreeError::invalid(format!(
                    "transition on '{}' has no event, no condition and no target",
                    raw.id
                )));
            }

            let kind = match t.kind.as_deref() {
                Some("internal") => TransitionKind::Internal,
                Some("external") | None => TransitionKind::External,
                Some(other) => {
                    return Err(TreeError::invalid(format!(
                        "unknown transition type '{}' on '{}'",
                        other, raw.id
                    )))
                }
            };

            transitions.push(Transition {
                source: id,
                events,
                cond: t.cond.clone(),
                targets,
                kind,
                actions: t.actions.clone(),
            });
        }
        self.nodes[id.index()].transitions = transitions;
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<DocumentId, TreeError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| TreeError::UnknownState {
                name: name.to_string(),
            })
    }

    fn is_descendant(&self, mut a: DocumentId, b: DocumentId) -> bool {
        while let Some(parent) = self.nodes[a.index()].parent {
            if parent == b {
                return true;
            }
            a = parent;
        }
        false
    }

    fn state_children(&self, id: DocumentId) -> impl Iterator<Item = DocumentId> + '_ {
        self.nodes[id.index()]
            .children
            .iter()
            .copied()
            .filter(|c| !matches!(self.nodes[c.index()].kind, StateKind::History { .. }))
    }
}

fn parse_history_kind(raw: &StateRaw) -> Result<HistoryKind, TreeError> {
    match raw.history.as_deref() {
        Some("shallow") | None => Ok(HistoryKind::Shallow),
        Some("deep") => Ok(HistoryKind::Deep),
        Some(other) => Err(TreeError::invalid(format!(
            "unknown history kind '{}' on '{}'",
            other, raw.id
        ))),
    }
}
