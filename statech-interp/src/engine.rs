//! The step engine.
//!
//! One [`Interpreter`] drives one instance: it owns the configuration,
//! the data model and the invoke coordinator, and advances the machine
//! one macrostep at a time. The event queues live with the host so the
//! host can await new events while the interpreter is idle; every call
//! that moves the machine borrows them explicitly.
//!
//! A macrostep is one triggering event (or none, at start) plus the
//! eventless transitions it unlocks, run until the configuration
//! stabilizes or a top-level final state completes the instance. The
//! eventless loop is bounded; exceeding the bound marks the machine
//! malformed and fails the instance.

use crate::configuration::Configuration;
use crate::datamodel::{DataModelHandler, EvalContext};
use crate::error::InterpError;
use crate::invoke::{InvokeCoordinator, ServiceFactory};
use crate::snapshot::{HistoryRecord, InstanceRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statech_event::{
    EnqueueHandle, Event, EventKind, EventQueueSet, InvokeId, IoProcessor, OutgoingEvent, SendId,
    SendTarget, SessionId,
};
use statech_tree::{Action, DocumentId, DoneData, HistoryKind, SendParams, StateChart, StateKind};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Tunables of one interpreter instance.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Eventless-transition iterations allowed per macrostep before the
    /// machine is declared malformed.
    pub max_iterations: u32,

    /// Capture a snapshot record after every microstep instead of only
    /// at macrostep boundaries.
    pub snapshot_each_microstep: bool,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1024,
            snapshot_each_microstep: false,
        }
    }
}

impl InterpreterConfig {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_snapshot_each_microstep(mut self, enabled: bool) -> Self {
        self.snapshot_each_microstep = enabled;
        self
    }
}

/// Lifecycle of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterStatus {
    Running,
    Done,
    Failed,
}

impl InterpreterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterpreterStatus::Running => "running",
            InterpreterStatus::Done => "done",
            InterpreterStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(InterpreterStatus::Running),
            "done" => Some(InterpreterStatus::Done),
            "failed" => Some(InterpreterStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for InterpreterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion notification of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneEvent {
    /// Name of the top-level final state that was entered.
    pub final_state: String,

    /// Evaluated done-data of that state.
    pub data: Value,
}

/// What one macrostep did.
#[derive(Debug, Default)]
pub struct MacrostepOutcome {
    /// The configuration changed during this macrostep.
    pub configuration_changed: bool,

    /// Set when the instance reached a top-level final state.
    pub done: Option<DoneEvent>,

    /// Recoverable error events raised during this macrostep. Each was
    /// also enqueued internally, so machines can transition on them.
    pub errors: Vec<Event>,

    /// Per-microstep snapshots, populated only when
    /// [`InterpreterConfig::snapshot_each_microstep`] is set.
    pub snapshots: Vec<InstanceRecord>,
}

/// A transition picked by the selection pass, with its precomputed
/// domain and exit set.
struct Selected {
    source: DocumentId,
    index: usize,
    domain: DocumentId,
    exit: BTreeSet<DocumentId>,
}

/// The per-instance step engine.
pub struct Interpreter {
    chart: Arc<StateChart>,
    session_id: SessionId,
    config: InterpreterConfig,
    status: InterpreterStatus,
    configuration: Configuration,
    datamodel: Box<dyn DataModelHandler>,
    invokes: InvokeCoordinator,
    io: Arc<dyn IoProcessor>,
}

impl Interpreter {
    /// Builds an interpreter for a fresh instance. `enqueue` must be a
    /// handle onto the queue set later passed to [`start`](Self::start)
    /// and [`run_macrostep`](Self::run_macrostep); invoked children
    /// deliver their events through it.
    pub fn new(
        chart: Arc<StateChart>,
        session_id: SessionId,
        datamodel: Box<dyn DataModelHandler>,
        factory: Arc<dyn ServiceFactory>,
        io: Arc<dyn IoProcessor>,
        config: InterpreterConfig,
        enqueue: EnqueueHandle,
    ) -> Self {
        let invokes = InvokeCoordinator::new(session_id.clone(), factory, enqueue);
        Self {
            chart,
            session_id,
            config,
            status: InterpreterStatus::Running,
            configuration: Configuration::new(),
            datamodel,
            invokes,
            io,
        }
    }

    pub fn status(&self) -> InterpreterStatus {
        self.status
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn chart(&self) -> &Arc<StateChart> {
        &self.chart
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn datamodel(&self) -> &dyn DataModelHandler {
        self.datamodel.as_ref()
    }

    pub fn invokes(&self) -> &InvokeCoordinator {
        &self.invokes
    }

    /// Set of active state names, for assertions and diagnostics.
    pub fn active_names(&self) -> Vec<String> {
        self.configuration
            .iter()
            .map(|id| self.chart.node(id).name.clone())
            .collect()
    }

    /// Initializes the data model and enters the initial configuration,
    /// then runs the first macrostep to quiescence.
    pub fn start(&mut self, queues: &mut EventQueueSet) -> Result<MacrostepOutcome, InterpError> {
        let chart = Arc::clone(&self.chart);
        let session = self.session_id.clone();
        let ctx = EvalContext {
            session_id: &session,
            event: None,
        };
        self.datamodel
            .init(&chart.datamodel, &ctx)
            .map_err(|e| self.fail(InterpError::DataModel {
                reason: e.to_string(),
            }))?;

        let mut errors = Vec::new();
        let mut entry = BTreeSet::new();
        let mut deferred = Vec::new();
        for target in chart.initial_targets(chart.root()) {
            self.add_target(&chart, target, chart.root(), &mut entry, &mut deferred);
        }
        self.complete_parallel_regions(&chart, &mut entry, &mut deferred);
        self.enter_states(&chart, &entry, &deferred, None, queues, &mut errors);

        tracing::debug!(
            session = %self.session_id,
            chart = %chart.name,
            active = self.configuration.len(),
            "instance started"
        );

        let mut outcome = self.run_macrostep(queues, None)?;
        outcome.configuration_changed = true;
        let mut all_errors = errors;
        all_errors.append(&mut outcome.errors);
        outcome.errors = all_errors;
        Ok(outcome)
    }

    /// Runs one macrostep: the given event (if any) plus all eventless
    /// transitions, until the configuration stabilizes, the instance
    /// completes, or the iteration cap declares the machine malformed.
    ///
    /// Never re-entrant for the same instance; after completion or
    /// failure it is a no-op.
    pub fn run_macrostep(
        &mut self,
        queues: &mut EventQueueSet,
        event: Option<Event>,
    ) -> Result<MacrostepOutcome, InterpError> {
        let mut outcome = MacrostepOutcome::default();
        if self.status != InterpreterStatus::Running {
            return Ok(outcome);
        }
        let chart = Arc::clone(&self.chart);
        let mut errors = Vec::new();

        if let Some(ref ev) = event {
            if ev.kind == EventKind::External {
                for failed in self.invokes.forward(ev) {
                    let error = Event::error_communication(format!(
                        "autoforward of '{}' to invoke {failed} failed",
                        ev.name
                    ));
                    errors.push(error.clone());
                    queues.push_internal(error);
                }
            }

            let selected = self.select_transitions(&chart, Some(ev))?;
            if !selected.is_empty() {
                self.microstep(&chart, &selected, Some(ev), queues, &mut errors);
                outcome.configuration_changed = true;
                if self.config.snapshot_each_microstep {
                    outcome.snapshots.push(self.capture(queues)?);
                }
            }
        }

        let mut iterations = 0u32;
        loop {
            if let Some(final_id) = self.active_top_level_final(&chart) {
                outcome.done = Some(self.complete(&chart, final_id, queues, &mut errors));
                outcome.configuration_changed = true;
                break;
            }

            iterations += 1;
            if iterations > self.config.max_iterations {
                return Err(self.fail(InterpError::MalformedMachine {
                    reason: format!(
                        "eventless transitions did not settle after {} iterations",
                        self.config.max_iterations
                    ),
                }));
            }

            let selected = self.select_transitions(&chart, None)?;
            if selected.is_empty() {
                break;
            }
            self.microstep(&chart, &selected, None, queues, &mut errors);
            outcome.configuration_changed = true;
            if self.config.snapshot_each_microstep {
                outcome.snapshots.push(self.capture(queues)?);
            }
        }

        if self.status == InterpreterStatus::Running {
            if let Err(reason) = self.configuration.validate(&chart, &self.session_id) {
                return Err(self.fail(InterpError::IllegalConfiguration { reason }));
            }
        }

        outcome.errors = errors;
        Ok(outcome)
    }

    /// Processes every immediately available event, internal queue
    /// first, until both queues are drained or the instance stops.
    pub fn run_to_quiescence(
        &mut self,
        queues: &mut EventQueueSet,
    ) -> Result<Vec<MacrostepOutcome>, InterpError> {
        let mut outcomes = Vec::new();
        while self.status == InterpreterStatus::Running {
            let Some(event) = queues.try_dequeue() else {
                break;
            };
            outcomes.push(self.run_macrostep(queues, Some(event))?);
        }
        Ok(outcomes)
    }

    /// Captures the full logical state of the instance. Valid only at
    /// step boundaries; the caller decides where the record goes.
    pub fn capture(&self, queues: &EventQueueSet) -> Result<InstanceRecord, InterpError> {
        let blob = self
            .datamodel
            .snapshot()
            .map_err(|e| InterpError::SnapshotFailed {
                reason: e.to_string(),
            })?;
        let mut history: Vec<HistoryRecord> = self
            .configuration
            .history_entries()
            .map(|(h, members)| HistoryRecord {
                history: h,
                members: members.iter().copied().collect(),
            })
            .collect();
        history.sort_by_key(|r| r.history);

        Ok(InstanceRecord {
            chart_name: self.chart.name.clone(),
            chart_version: self.chart.version,
            chart_checksum: self.chart.checksum.clone(),
            session_id: self.session_id.clone(),
            status: self.status.as_str().to_string(),
            active: self.configuration.iter().collect(),
            history,
            pending_sends: queues.pending_sends(),
            invokes: self.invokes.snapshot(),
            datamodel: blob,
            captured_at: InstanceRecord::captured_now(),
        })
    }

    /// Rebuilds an interpreter from a captured record.
    ///
    /// The record must have been captured against the same definition:
    /// the checksum and every referenced node id are validated before
    /// anything is restored. Pending sends are rescheduled with their
    /// remaining delays; live invokes are restarted, and any restart
    /// failure becomes an `error.communication` event.
    pub fn resume(
        chart: Arc<StateChart>,
        record: InstanceRecord,
        mut datamodel: Box<dyn DataModelHandler>,
        factory: Arc<dyn ServiceFactory>,
        io: Arc<dyn IoProcessor>,
        config: InterpreterConfig,
        queues: &mut EventQueueSet,
    ) -> Result<Self, InterpError> {
        if record.chart_name != chart.name || record.chart_version != chart.version {
            return Err(InterpError::RecordMismatch {
                reason: format!(
                    "record is for {} v{}, definition is {} v{}",
                    record.chart_name, record.chart_version, chart.name, chart.version
                ),
            });
        }
        if record.chart_checksum != chart.checksum {
            return Err(InterpError::RecordMismatch {
                reason: format!(
                    "record checksum {} does not match definition checksum {}",
                    record.chart_checksum, chart.checksum
                ),
            });
        }

        let mut referenced: Vec<DocumentId> = record.active.clone();
        for h in &record.history {
            referenced.push(h.history);
            referenced.extend(h.members.iter().copied());
        }
        referenced.extend(record.invokes.iter().map(|i| i.owner));
        for id in referenced {
            if chart.get(id).is_none() {
                return Err(InterpError::RecordMismatch {
                    reason: format!("record references unknown node {id}"),
                });
            }
        }

        let status =
            InterpreterStatus::parse(&record.status).ok_or_else(|| InterpError::RecordMismatch {
                reason: format!("unknown status '{}'", record.status),
            })?;

        datamodel
            .restore(&record.datamodel)
            .map_err(|e| InterpError::DataModel {
                reason: e.to_string(),
            })?;

        let configuration = Configuration::from_parts(
            record.active.iter().copied(),
            record
                .history
                .iter()
                .map(|h| (h.history, h.members.iter().copied().collect())),
        );
        if status == InterpreterStatus::Running {
            configuration
                .validate(&chart, &record.session_id)
                .map_err(|reason| InterpError::IllegalConfiguration { reason })?;
        }

        let invokes = InvokeCoordinator::new(record.session_id.clone(), factory, queues.handle());
        for failed in invokes.restore(record.invokes) {
            queues.push_internal(Event::error_communication(format!(
                "restart of invoke {failed} failed on resume"
            )));
        }
        queues.restore_pending(record.pending_sends);

        tracing::debug!(
            session = %record.session_id,
            chart = %chart.name,
            status = %status,
            "instance resumed"
        );

        Ok(Self {
            chart,
            session_id: record.session_id,
            config,
            status,
            configuration,
            datamodel,
            invokes,
            io,
        })
    }

    /// Cancels everything the instance still owns without running exit
    /// actions. Used when the host destroys an instance.
    pub fn teardown(&mut self, queues: &EventQueueSet) {
        self.invokes.cancel_all();
        queues.cancel_all_pending();
        self.configuration.clear();
        if self.status == InterpreterStatus::Running {
            self.status = InterpreterStatus::Done;
        }
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    /// Picks at most one transition per active atomic state: the first
    /// transition in document order, walking the atomic state then its
    /// ancestors, whose event descriptors and guard both match. Picks
    /// whose exit sets overlap are then resolved in favor of the
    /// transition sourced closer to the root, document order breaking
    /// remaining ties.
    fn select_transitions(
        &mut self,
        chart: &StateChart,
        event: Option<&Event>,
    ) -> Result<Vec<Selected>, InterpError> {
        let atomics = self.configuration.atomic_states(chart);
        let mut picks: Vec<Selected> = Vec::new();
        let mut seen: HashSet<(DocumentId, usize)> = HashSet::new();

        for atomic in atomics {
            'walk: for source in
                std::iter::once(atomic).chain(chart.ancestors(atomic))
            {
                for (index, transition) in chart.node(source).transitions.iter().enumerate() {
                    let event_ok = match event {
                        Some(ev) => transition.matches_event(&ev.name),
                        None => transition.is_eventless(),
                    };
                    if !event_ok {
                        continue;
                    }
                    if !self.eval_guard(transition.cond.as_deref(), event)? {
                        continue;
                    }
                    if seen.insert((source, index)) {
                        let (domain, exit) = self.domain_and_exit(chart, source, index);
                        picks.push(Selected {
                            source,
                            index,
                            domain,
                            exit,
                        });
                    }
                    break 'walk;
                }
            }
        }

        // Conflict resolution over overlapping exit sets.
        let mut filtered: Vec<Selected> = Vec::new();
        'candidates: for cand in picks {
            let mut displaced = Vec::new();
            for (i, kept) in filtered.iter().enumerate() {
                if cand.exit.is_disjoint(&kept.exit) {
                    continue;
                }
                if chart.is_descendant(cand.source, kept.source) {
                    // Kept transition sourced at an ancestor wins.
                    continue 'candidates;
                }
                if chart.is_descendant(kept.source, cand.source) {
                    displaced.push(i);
                    continue;
                }
                // Unrelated sources: the earlier pick wins.
                continue 'candidates;
            }
            for i in displaced.into_iter().rev() {
                filtered.remove(i);
            }
            filtered.push(cand);
        }
        Ok(filtered)
    }

    /// Exit/entry domain of a transition and the active states it will
    /// exit. Targetless transitions exit nothing.
    fn domain_and_exit(
        &self,
        chart: &StateChart,
        source: DocumentId,
        index: usize,
    ) -> (DocumentId, BTreeSet<DocumentId>) {
        let transition = &chart.node(source).transitions[index];
        if transition.targets.is_empty() {
            return (source, BTreeSet::new());
        }

        let internal_within_source = transition.kind == statech_tree::TransitionKind::Internal
            && chart.node(source).is_compound()
            && transition
                .targets
                .iter()
                .all(|t| chart.is_descendant(*t, source));
        let domain = if internal_within_source {
            source
        } else {
            let mut ids = Vec::with_capacity(transition.targets.len() + 1);
            ids.push(source);
            ids.extend(transition.targets.iter().copied());
            chart.lcca(&ids)
        };

        let exit = self
            .configuration
            .iter()
            .filter(|id| chart.is_descendant(*id, domain))
            .collect();
        (domain, exit)
    }

    fn eval_guard(
        &mut self,
        cond: Option<&str>,
        event: Option<&Event>,
    ) -> Result<bool, InterpError> {
        let Some(expr) = cond else {
            return Ok(true);
        };
        let session = self.session_id.clone();
        let ctx = EvalContext {
            session_id: &session,
            event,
        };
        match self.datamodel.evaluate_guard(expr, &ctx) {
            Ok(truth) => Ok(truth),
            Err(e) => Err(self.fail(InterpError::GuardEvaluation {
                expr: expr.to_string(),
                reason: e.to_string(),
            })),
        }
    }

    // -------------------------------------------------------------------------
    // Microstep
    // -------------------------------------------------------------------------

    /// One round of exit, transition actions, entry.
    fn microstep(
        &mut self,
        chart: &StateChart,
        selected: &[Selected],
        event: Option<&Event>,
        queues: &mut EventQueueSet,
        errors: &mut Vec<Event>,
    ) {
        let exit_set: BTreeSet<DocumentId> = selected
            .iter()
            .flat_map(|s| s.exit.iter().copied())
            .collect();

        // History memory reflects the configuration as it was before
        // any state in this microstep exits.
        let mut memories: Vec<(DocumentId, DocumentId, BTreeSet<DocumentId>)> = Vec::new();
        for &exited in &exit_set {
            let node = chart.node(exited);
            for &child in &node.children {
                if let StateKind::History { kind } = chart.node(child).kind {
                    let members: BTreeSet<DocumentId> = match kind {
                        HistoryKind::Shallow => node
                            .state_children(chart)
                            .filter(|c| self.configuration.contains(*c))
                            .collect(),
                        HistoryKind::Deep => self
                            .configuration
                            .iter()
                            .filter(|d| {
                                chart.node(*d).is_atomic() && chart.is_descendant(*d, exited)
                            })
                            .collect(),
                    };
                    memories.push((exited, child, members));
                }
            }
        }

        // Exit in reverse document order.
        for &exited in exit_set.iter().rev() {
            for action in chart.node(exited).on_exit.clone() {
                self.execute_action(&action, event, queues, errors);
            }
            self.invokes.cancel_owned_by(exited);
            for (owner, history, members) in &memories {
                if *owner == exited {
                    self.configuration.record_history(*history, members.clone());
                }
            }
            self.configuration.remove(exited);
        }

        // Transition actions, in selection (document) order.
        for s in selected {
            let actions = chart.node(s.source).transitions[s.index].actions.clone();
            for action in actions {
                self.execute_action(&action, event, queues, errors);
            }
        }

        // Entry set: targets, their ancestors up to the domain, and
        // default-initial completion of everything entered.
        let mut entry = BTreeSet::new();
        let mut deferred = Vec::new();
        for s in selected {
            let targets = chart.node(s.source).transitions[s.index].targets.clone();
            for target in targets {
                self.add_target(chart, target, s.domain, &mut entry, &mut deferred);
            }
        }
        self.complete_parallel_regions(chart, &mut entry, &mut deferred);
        self.enter_states(chart, &entry, &deferred, event, queues, errors);
    }

    /// Adds a transition target to the entry set: the target itself
    /// (history targets are resolved to their remembered or default
    /// member sets), its ancestors below the domain, and its
    /// default-initial descendants.
    fn add_target(
        &self,
        chart: &StateChart,
        target: DocumentId,
        domain: DocumentId,
        entry: &mut BTreeSet<DocumentId>,
        deferred: &mut Vec<Action>,
    ) {
        for anc in chart.ancestors(target) {
            if anc == domain {
                break;
            }
            entry.insert(anc);
        }
        if chart.node(target).is_history() {
            self.resolve_history(chart, target, entry, deferred);
        } else {
            entry.insert(target);
            self.add_descendants(chart, target, entry, deferred);
        }
    }

    /// Completes an entered state downward: declared initial for
    /// compound states, every region for parallel states.
    fn add_descendants(
        &self,
        chart: &StateChart,
        id: DocumentId,
        entry: &mut BTreeSet<DocumentId>,
        deferred: &mut Vec<Action>,
    ) {
        match &chart.node(id).kind {
            StateKind::Compound { initial } => {
                for &target in initial {
                    if chart.node(target).is_history() {
                        self.resolve_history(chart, target, entry, deferred);
                        continue;
                    }
                    self.insert_with_ancestors(chart, target, id, entry);
                    self.add_descendants(chart, target, entry, deferred);
                }
            }
            StateKind::Parallel => {
                let regions: Vec<DocumentId> = chart.node(id).state_children(chart).collect();
                for region in regions {
                    entry.insert(region);
                    self.add_descendants(chart, region, entry, deferred);
                }
            }
            _ => {}
        }
    }

    /// Expands a history pseudo-state into its remembered member set,
    /// or the targets of its default transition when nothing is
    /// remembered, or the parent's declared initial as a last resort.
    /// The default transition's actions are collected for execution
    /// before the entry pass.
    fn resolve_history(
        &self,
        chart: &StateChart,
        history: DocumentId,
        entry: &mut BTreeSet<DocumentId>,
        deferred: &mut Vec<Action>,
    ) {
        let node = chart.node(history);
        let parent = match node.parent {
            Some(p) => p,
            None => return,
        };

        if let Some(members) = self.configuration.history_of(history) {
            if !members.is_empty() {
                for &member in members {
                    self.insert_with_ancestors(chart, member, parent, entry);
                    self.add_descendants(chart, member, entry, deferred);
                }
                return;
            }
        }

        if let Some(default) = node.transitions.first() {
            deferred.extend(default.actions.iter().cloned());
            for &target in &default.targets {
                self.insert_with_ancestors(chart, target, parent, entry);
                self.add_descendants(chart, target, entry, deferred);
            }
            return;
        }

        for target in chart.initial_targets(parent) {
            self.insert_with_ancestors(chart, target, parent, entry);
            self.add_descendants(chart, target, entry, deferred);
        }
    }

    /// Completes parallel states pulled into the entry set as bare
    /// ancestors of a target: every sibling region not on a target
    /// path is default-entered. Runs to fixpoint since a defaulted
    /// region can itself contain another parallel.
    fn complete_parallel_regions(
        &self,
        chart: &StateChart,
        entry: &mut BTreeSet<DocumentId>,
        deferred: &mut Vec<Action>,
    ) {
        loop {
            let missing: Vec<DocumentId> = entry
                .iter()
                .filter(|&&id| matches!(chart.node(id).kind, StateKind::Parallel))
                .flat_map(|&id| chart.node(id).state_children(chart))
                .filter(|region| !entry.contains(region))
                .collect();
            if missing.is_empty() {
                break;
            }
            for region in missing {
                entry.insert(region);
                self.add_descendants(chart, region, entry, deferred);
            }
        }
    }

    fn insert_with_ancestors(
        &self,
        chart: &StateChart,
        id: DocumentId,
        stop: DocumentId,
        entry: &mut BTreeSet<DocumentId>,
    ) {
        entry.insert(id);
        for anc in chart.ancestors(id) {
            if anc == stop {
                break;
            }
            entry.insert(anc);
        }
    }

    /// Enters the computed entry set in document order: activate, run
    /// entry actions, start declared invokes, raise done events for
    /// entered final states.
    fn enter_states(
        &mut self,
        chart: &StateChart,
        entry: &BTreeSet<DocumentId>,
        deferred: &[Action],
        event: Option<&Event>,
        queues: &mut EventQueueSet,
        errors: &mut Vec<Event>,
    ) {
        for action in deferred {
            self.execute_action(action, event, queues, errors);
        }
        for &id in entry {
            self.configuration.insert(id);
            for action in chart.node(id).on_entry.clone() {
                self.execute_action(&action, event, queues, errors);
            }
            self.start_invokes(chart, id, event, queues, errors);
            if chart.node(id).is_final() {
                self.raise_done_events(chart, id, event, queues, errors);
            }
        }
    }

    fn start_invokes(
        &mut self,
        chart: &StateChart,
        id: DocumentId,
        event: Option<&Event>,
        queues: &mut EventQueueSet,
        errors: &mut Vec<Event>,
    ) {
        for def in chart.node(id).invokes.clone() {
            let payload = match &def.payload {
                Some(expr) => match self.eval_value(expr, event) {
                    Ok(value) => value,
                    Err(reason) => {
                        self.report(Event::error_execution(reason), queues, errors);
                        continue;
                    }
                },
                None => Value::Null,
            };
            let invoke_id = def
                .id
                .clone()
                .map(InvokeId::new)
                .unwrap_or_else(InvokeId::generate);
            if let Err(e) = self
                .invokes
                .start(invoke_id, &def.type_uri, payload, def.autoforward, id)
            {
                self.report(
                    Event::error_communication(format!("invoke start failed: {e}")),
                    queues,
                    errors,
                );
            }
        }
    }

    /// Raises `done.state.<parent>` when a final child is entered, and
    /// `done.state.<grandparent>` when that completes a parallel state.
    fn raise_done_events(
        &mut self,
        chart: &StateChart,
        final_id: DocumentId,
        event: Option<&Event>,
        queues: &mut EventQueueSet,
        errors: &mut Vec<Event>,
    ) {
        let Some(parent) = chart.node(final_id).parent else {
            return;
        };
        if parent == chart.root() {
            // Top-level completion is handled by the macrostep loop.
            return;
        }

        let done_data = match &chart.node(final_id).kind {
            StateKind::Final { done_data } => done_data.clone(),
            _ => None,
        };
        let data = self.eval_done_data(done_data.as_ref(), event, queues, errors);
        queues.push_internal(Event::done_state(&chart.node(parent).name, data));

        if let Some(grandparent) = chart.node(parent).parent {
            if grandparent != chart.root()
                && chart.node(grandparent).is_parallel()
                && self.configuration.in_final_state(chart, grandparent)
            {
                queues.push_internal(Event::done_state(
                    &chart.node(grandparent).name,
                    Value::Null,
                ));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    fn active_top_level_final(&self, chart: &StateChart) -> Option<DocumentId> {
        chart
            .node(chart.root())
            .state_children(chart)
            .find(|c| chart.node(*c).is_final() && self.configuration.contains(*c))
    }

    /// Finishes the instance: evaluates the done-data, exits every
    /// active state in reverse document order, cancels live invokes and
    /// pending sends.
    fn complete(
        &mut self,
        chart: &StateChart,
        final_id: DocumentId,
        queues: &mut EventQueueSet,
        errors: &mut Vec<Event>,
    ) -> DoneEvent {
        let done_data = match &chart.node(final_id).kind {
            StateKind::Final { done_data } => done_data.clone(),
            _ => None,
        };
        let data = self.eval_done_data(done_data.as_ref(), None, queues, errors);

        let active: Vec<DocumentId> = self.configuration.iter().collect();
        for &id in active.iter().rev() {
            for action in chart.node(id).on_exit.clone() {
                self.execute_action(&action, None, queues, errors);
            }
            self.invokes.cancel_owned_by(id);
            self.configuration.remove(id);
        }
        self.invokes.cancel_all();
        queues.cancel_all_pending();
        self.status = InterpreterStatus::Done;

        tracing::info!(
            session = %self.session_id,
            final_state = %chart.node(final_id).name,
            "instance completed"
        );

        DoneEvent {
            final_state: chart.node(final_id).name.clone(),
            data,
        }
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    /// Runs one action. Failures never abort the step: they become
    /// `error.execution` / `error.communication` events on the internal
    /// queue, where the machine itself can transition on them.
    fn execute_action(
        &mut self,
        action: &Action,
        event: Option<&Event>,
        queues: &mut EventQueueSet,
        errors: &mut Vec<Event>,
    ) {
        match action {
            Action::Raise { event: name } => {
                queues.push_internal(Event::internal(name.clone(), Value::Null));
            }
            Action::Assign { location, expr } => match self.eval_value(expr, event) {
                Ok(value) => {
                    let session = self.session_id.clone();
                    let ctx = EvalContext {
                        session_id: &session,
                        event,
                    };
                    if let Err(e) = self.datamodel.assign(location, value, &ctx) {
                        self.report(Event::error_execution(e.to_string()), queues, errors);
                    }
                }
                Err(reason) => {
                    self.report(Event::error_execution(reason), queues, errors);
                }
            },
            Action::Log { label, expr } => {
                let value = match expr {
                    Some(expr) => match self.eval_value(expr, event) {
                        Ok(v) => v,
                        Err(reason) => {
                            self.report(Event::error_execution(reason), queues, errors);
                            return;
                        }
                    },
                    None => Value::Null,
                };
                tracing::info!(
                    session = %self.session_id,
                    label = label.as_deref().unwrap_or(""),
                    value = %value,
                    "log action"
                );
            }
            Action::Send(params) => self.execute_send(params, event, queues, errors),
            Action::Cancel { sendid, sendid_expr } => {
                let id = match (sendid, sendid_expr) {
                    (Some(literal), _) => Some(literal.clone()),
                    (None, Some(expr)) => match self.eval_value(expr, event) {
                        Ok(Value::String(s)) => Some(s),
                        Ok(other) => {
                            self.report(
                                Event::error_execution(format!(
                                    "cancel sendid expression produced {other}, not a string"
                                )),
                                queues,
                                errors,
                            );
                            None
                        }
                        Err(reason) => {
                            self.report(Event::error_execution(reason), queues, errors);
                            None
                        }
                    },
                    (None, None) => {
                        self.report(
                            Event::error_execution("cancel without a send id"),
                            queues,
                            errors,
                        );
                        None
                    }
                };
                if let Some(id) = id {
                    // Canceling an already-delivered send is a no-op.
                    queues.cancel_send(&SendId::new(id));
                }
            }
        }
    }

    fn execute_send(
        &mut self,
        params: &SendParams,
        event: Option<&Event>,
        queues: &mut EventQueueSet,
        errors: &mut Vec<Event>,
    ) {
        let data = match &params.payload {
            Some(expr) => match self.eval_value(expr, event) {
                Ok(value) => value,
                Err(reason) => {
                    self.report(Event::error_execution(reason), queues, errors);
                    return;
                }
            },
            None => Value::Null,
        };
        let send_id = params
            .id
            .clone()
            .map(SendId::new)
            .unwrap_or_else(SendId::generate);

        match SendTarget::classify(params.target.as_deref()) {
            SendTarget::Internal => {
                if params.delay_ms > 0 {
                    self.report(
                        Event::error_execution("internal-target send cannot be delayed"),
                        queues,
                        errors,
                    );
                    return;
                }
                queues.push_internal(
                    Event::internal(params.event.clone(), data).with_send_id(send_id),
                );
            }
            SendTarget::SelfExternal => {
                let outgoing =
                    Event::external(params.event.clone(), data).with_send_id(send_id.clone());
                if params.delay_ms > 0 {
                    queues.schedule_send(
                        send_id,
                        outgoing,
                        Duration::from_millis(params.delay_ms),
                    );
                } else {
                    queues.enqueue_external(outgoing);
                }
            }
            SendTarget::Invoke(raw_id) => {
                if params.delay_ms > 0 {
                    self.report(
                        Event::error_execution("delayed send to an invoked child is unsupported"),
                        queues,
                        errors,
                    );
                    return;
                }
                let outgoing = Event::external(params.event.clone(), data)
                    .with_send_id(send_id)
                    .with_origin(format!("#_scxml_{}", self.session_id));
                if let Err(e) = self.invokes.forward_to(&InvokeId::new(raw_id), outgoing) {
                    self.report(
                        Event::error_communication(e.to_string()),
                        queues,
                        errors,
                    );
                }
            }
            SendTarget::External(target) => {
                if params.delay_ms > 0 {
                    self.report(
                        Event::error_execution("delayed send to an external target is unsupported"),
                        queues,
                        errors,
                    );
                    return;
                }
                let outgoing = Event::external(params.event.clone(), data)
                    .with_send_id(send_id)
                    .with_origin(format!("#_scxml_{}", self.session_id));
                if let Err(e) = self.io.try_send(OutgoingEvent {
                    target,
                    event: outgoing,
                }) {
                    self.report(
                        Event::error_communication(e.to_string()),
                        queues,
                        errors,
                    );
                }
            }
        }
    }

    fn eval_done_data(
        &mut self,
        done_data: Option<&DoneData>,
        event: Option<&Event>,
        queues: &mut EventQueueSet,
        errors: &mut Vec<Event>,
    ) -> Value {
        let Some(done_data) = done_data else {
            return Value::Null;
        };
        if let Some(expr) = &done_data.expr {
            match self.eval_value(expr, event) {
                Ok(value) => return value,
                Err(reason) => {
                    self.report(Event::error_execution(reason), queues, errors);
                    return Value::Null;
                }
            }
        }
        done_data.content.clone().unwrap_or(Value::Null)
    }

    fn eval_value(&mut self, expr: &str, event: Option<&Event>) -> Result<Value, String> {
        let session = self.session_id.clone();
        let ctx = EvalContext {
            session_id: &session,
            event,
        };
        self.datamodel
            .evaluate_value(expr, &ctx)
            .map_err(|e| e.to_string())
    }

    fn report(&self, error: Event, queues: &mut EventQueueSet, errors: &mut Vec<Event>) {
        tracing::debug!(session = %self.session_id, error = %error.name, "recoverable error");
        errors.push(error.clone());
        queues.push_internal(error);
    }

    fn fail(&mut self, error: InterpError) -> InterpError {
        tracing::error!(
            session = %self.session_id,
            code = error.code(),
            %error,
            "instance failed"
        );
        self.status = InterpreterStatus::Failed;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::JsonDataModel;
    use crate::invoke::NullServiceFactory;
    use proptest::prelude::*;
    use serde_json::json;
    use statech_event::UnreachableIo;

    fn interp(chart: Arc<StateChart>, queues: &EventQueueSet) -> Interpreter {
        Interpreter::new(
            chart,
            SessionId::generate(),
            Box::new(JsonDataModel::new()),
            Arc::new(NullServiceFactory),
            Arc::new(UnreachableIo),
            InterpreterConfig::default(),
            queues.handle(),
        )
    }

    fn chart(def: serde_json::Value) -> Arc<StateChart> {
        Arc::new(StateChart::from_json("test", 1, &def).unwrap())
    }

    fn active(interp: &Interpreter) -> Vec<String> {
        let mut names = interp.active_names();
        names.sort();
        names
    }

    fn datamodel_ctx(interp: &Interpreter) -> Value {
        serde_json::from_slice(&interp.datamodel().snapshot().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_immediate_completion_with_done_data() {
        let chart = chart(json!({
            "states": [{"id": "end", "type": "final", "donedata": {"expr": "22"}}]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);

        let outcome = interp.start(&mut queues).unwrap();
        let done = outcome.done.unwrap();
        assert_eq!(done.final_state, "end");
        assert_eq!(done.data, json!(22));
        assert_eq!(interp.status(), InterpreterStatus::Done);
        assert!(interp.configuration().is_empty());

        // No further events are processed.
        let after = interp
            .run_macrostep(&mut queues, Some(Event::external("tick", Value::Null)))
            .unwrap();
        assert!(!after.configuration_changed);
    }

    #[tokio::test]
    async fn test_self_transition_counts_ticks() {
        let chart = chart(json!({
            "datamodel": {"count": 0},
            "states": [
                {"id": "a", "transitions": [
                    {"event": "tick", "target": "a", "actions": [
                        {"assign": {"location": "count", "expr": "ctx.count + 1"}}
                    ]}
                ]}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        for _ in 0..3 {
            interp
                .run_macrostep(&mut queues, Some(Event::external("tick", Value::Null)))
                .unwrap();
        }
        assert_eq!(datamodel_ctx(&interp)["count"], json!(3));
        assert_eq!(active(&interp), vec!["a"]);
    }

    #[tokio::test]
    async fn test_parallel_regions_step_independently() {
        let chart = chart(json!({
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "initial": "a", "states": [
                        {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                        {"id": "b"}
                    ]},
                    {"id": "r2", "initial": "c", "states": [
                        {"id": "c", "transitions": [{"event": "go", "target": "d"}]},
                        {"id": "d"}
                    ]}
                ]}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();
        assert_eq!(active(&interp), vec!["a", "c", "p", "r1", "r2"]);

        let outcome = interp
            .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
            .unwrap();
        assert!(outcome.configuration_changed);
        assert_eq!(active(&interp), vec!["b", "d", "p", "r1", "r2"]);
    }

    #[tokio::test]
    async fn test_target_inside_parallel_region_enters_sibling_regions() {
        let chart = chart(json!({
            "states": [
                {"id": "start", "transitions": [{"event": "go", "target": "a"}]},
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "initial": "a", "states": [
                        {"id": "a"},
                        {"id": "b"}
                    ]},
                    {"id": "r2", "initial": "c", "states": [
                        {"id": "c"},
                        {"id": "d"}
                    ]}
                ]}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();
        assert_eq!(active(&interp), vec!["start"]);

        // Targeting a state inside r1 must default-enter sibling r2.
        let outcome = interp
            .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
            .unwrap();
        assert!(outcome.configuration_changed);
        assert_eq!(active(&interp), vec!["a", "c", "p", "r1", "r2"]);
        assert_eq!(interp.status(), InterpreterStatus::Running);
    }

    #[tokio::test]
    async fn test_ancestor_transition_preempts_region() {
        // "go" matches both a region-local transition and one on the
        // parallel state itself; the ancestor's wins.
        let chart = chart(json!({
            "states": [
                {"id": "p", "type": "parallel",
                 "transitions": [{"event": "go", "target": "out"}],
                 "states": [
                    {"id": "r1", "initial": "a", "states": [
                        {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                        {"id": "b"}
                    ]},
                    {"id": "r2", "initial": "c", "states": [{"id": "c"}]}
                ]},
                {"id": "out"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        // r2's atomic "c" has no own match and walks up to p's
        // transition; its exit set overlaps a→b's, and p is the
        // ancestor source.
        interp
            .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
            .unwrap();
        assert_eq!(active(&interp), vec!["out"]);
    }

    #[tokio::test]
    async fn test_eventless_cascade_runs_in_one_macrostep() {
        let chart = chart(json!({
            "datamodel": {"ready": true},
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b", "transitions": [{"cond": "ctx.ready", "target": "c"}]},
                {"id": "c", "transitions": [{"cond": "ctx.ready", "target": "d"}]},
                {"id": "d"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        interp
            .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
            .unwrap();
        assert_eq!(active(&interp), vec!["d"]);
    }

    #[tokio::test]
    async fn test_nonterminating_eventless_loop_is_fatal() {
        let chart = chart(json!({
            "states": [
                {"id": "a", "transitions": [{"target": "b"}]},
                {"id": "b", "transitions": [{"target": "a"}]}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);

        let result = interp.start(&mut queues);
        assert!(matches!(result, Err(InterpError::MalformedMachine { .. })));
        assert_eq!(interp.status(), InterpreterStatus::Failed);
    }

    #[tokio::test]
    async fn test_raised_internal_event_beats_external() {
        // Entering "a" raises an internal event while an external one
        // is already queued; the internal transition must win.
        let chart = chart(json!({
            "states": [
                {"id": "a",
                 "onentry": [{"raise": {"event": "inner"}}],
                 "transitions": [
                    {"event": "inner", "target": "by_inner"},
                    {"event": "outer", "target": "by_outer"}
                 ]},
                {"id": "by_inner"},
                {"id": "by_outer"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        queues.enqueue_external(Event::external("outer", Value::Null));
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        interp.run_to_quiescence(&mut queues).unwrap();
        assert_eq!(active(&interp), vec!["by_inner"]);
    }

    #[tokio::test]
    async fn test_shallow_history_restores_last_child() {
        let chart = chart(json!({
            "initial": "work",
            "states": [
                {"id": "work", "initial": "one",
                 "transitions": [{"event": "pause", "target": "idle"}],
                 "states": [
                    {"id": "one", "transitions": [{"event": "next", "target": "two"}]},
                    {"id": "two"},
                    {"id": "mem", "type": "history", "history": "shallow",
                     "transitions": [{"target": "one"}]}
                ]},
                {"id": "idle", "transitions": [{"event": "resume", "target": "mem"}]}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        for name in ["next", "pause", "resume"] {
            interp
                .run_macrostep(&mut queues, Some(Event::external(name, Value::Null)))
                .unwrap();
        }
        assert_eq!(active(&interp), vec!["two", "work"]);
    }

    #[tokio::test]
    async fn test_deep_history_restores_nested_leaf() {
        let chart = chart(json!({
            "initial": "work",
            "states": [
                {"id": "work", "initial": "outer",
                 "transitions": [{"event": "pause", "target": "idle"}],
                 "states": [
                    {"id": "outer", "initial": "x", "states": [
                        {"id": "x", "transitions": [{"event": "next", "target": "y"}]},
                        {"id": "y"}
                    ]},
                    {"id": "mem", "type": "history", "history": "deep",
                     "transitions": [{"target": "outer"}]}
                ]},
                {"id": "idle", "transitions": [{"event": "resume", "target": "mem"}]}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        for name in ["next", "pause", "resume"] {
            interp
                .run_macrostep(&mut queues, Some(Event::external(name, Value::Null)))
                .unwrap();
        }
        assert_eq!(active(&interp), vec!["outer", "work", "y"]);
    }

    #[tokio::test]
    async fn test_history_default_used_when_nothing_remembered() {
        let chart = chart(json!({
            "initial": "idle",
            "states": [
                {"id": "work", "initial": "one", "states": [
                    {"id": "one"},
                    {"id": "two"},
                    {"id": "mem", "type": "history", "history": "shallow",
                     "transitions": [{"target": "two"}]}
                ]},
                {"id": "idle", "transitions": [{"event": "resume", "target": "mem"}]}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        interp
            .run_macrostep(&mut queues, Some(Event::external("resume", Value::Null)))
            .unwrap();
        assert_eq!(active(&interp), vec!["two", "work"]);
    }

    #[tokio::test]
    async fn test_internal_transition_skips_exit_actions() {
        let chart = chart(json!({
            "datamodel": {"exits": 0},
            "states": [
                {"id": "outer", "initial": "a",
                 "onexit": [{"assign": {"location": "exits", "expr": "ctx.exits + 1"}}],
                 "transitions": [
                    {"event": "inside", "target": "b", "type": "internal"},
                    {"event": "outside", "target": "other"}
                 ],
                 "states": [{"id": "a"}, {"id": "b"}]},
                {"id": "other"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        interp
            .run_macrostep(&mut queues, Some(Event::external("inside", Value::Null)))
            .unwrap();
        assert_eq!(active(&interp), vec!["b", "outer"]);
        assert_eq!(datamodel_ctx(&interp)["exits"], json!(0));

        interp
            .run_macrostep(&mut queues, Some(Event::external("outside", Value::Null)))
            .unwrap();
        assert_eq!(active(&interp), vec!["other"]);
        assert_eq!(datamodel_ctx(&interp)["exits"], json!(1));
    }

    #[tokio::test]
    async fn test_done_state_event_drives_parent_transition() {
        let chart = chart(json!({
            "initial": "job",
            "states": [
                {"id": "job", "initial": "running",
                 "transitions": [{"event": "done.state.job", "target": "report"}],
                 "states": [
                    {"id": "running", "transitions": [{"event": "finish", "target": "ok"}]},
                    {"id": "ok", "type": "final", "donedata": {"content": {"ok": true}}}
                ]},
                {"id": "report"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        interp
            .run_macrostep(&mut queues, Some(Event::external("finish", Value::Null)))
            .unwrap();
        // The done.state event is internal; drain it.
        interp.run_to_quiescence(&mut queues).unwrap();
        assert_eq!(active(&interp), vec!["report"]);
    }

    #[tokio::test]
    async fn test_bad_action_becomes_error_execution_event() {
        let chart = chart(json!({
            "states": [
                {"id": "a",
                 "transitions": [
                    {"event": "go", "target": "b",
                     "actions": [{"assign": {"location": "x", "expr": "%%"}}]},
                    {"event": "error.execution", "target": "caught"}
                 ]},
                {"id": "b", "transitions": [{"event": "error.execution", "target": "caught"}]},
                {"id": "caught"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        let outcome = interp
            .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
            .unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].name, "error.execution");
        // The machine itself handles the error event.
        interp.run_to_quiescence(&mut queues).unwrap();
        assert_eq!(active(&interp), vec!["caught"]);
    }

    #[tokio::test]
    async fn test_broken_guard_is_fatal() {
        let chart = chart(json!({
            "states": [
                {"id": "a", "transitions": [{"event": "go", "cond": "%%", "target": "b"}]},
                {"id": "b"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        let result = interp.run_macrostep(&mut queues, Some(Event::external("go", Value::Null)));
        assert!(matches!(result, Err(InterpError::GuardEvaluation { .. })));
        assert_eq!(interp.status(), InterpreterStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_send_then_cancel_never_delivers() {
        let chart = chart(json!({
            "states": [
                {"id": "a",
                 "onentry": [{"send": {"event": "boom", "delay_ms": 500, "id": "fuse"}}],
                 "transitions": [
                    {"event": "defuse", "target": "safe",
                     "actions": [{"cancel": {"sendid": "fuse"}}]},
                    {"event": "boom", "target": "exploded"}
                 ]},
                {"id": "safe", "transitions": [{"event": "boom", "target": "exploded"}]},
                {"id": "exploded"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();
        assert_eq!(queues.pending_count(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        interp
            .run_macrostep(&mut queues, Some(Event::external("defuse", Value::Null)))
            .unwrap();
        assert_eq!(queues.pending_count(), 0);

        tokio::time::advance(Duration::from_millis(1000)).await;
        tokio::task::yield_now().await;
        interp.run_to_quiescence(&mut queues).unwrap();
        assert_eq!(active(&interp), vec!["safe"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_send_delivers_without_cancel() {
        let chart = chart(json!({
            "states": [
                {"id": "a",
                 "onentry": [{"send": {"event": "boom", "delay_ms": 500}}],
                 "transitions": [{"event": "boom", "target": "exploded"}]},
                {"id": "exploded"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        interp.run_to_quiescence(&mut queues).unwrap();
        assert_eq!(active(&interp), vec!["exploded"]);
    }

    #[tokio::test]
    async fn test_internal_target_send_rejects_delay() {
        let chart = chart(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "target": "b",
                     "actions": [{"send": {"event": "x", "target": "#_internal", "delay_ms": 10}}]}
                ]},
                {"id": "b"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        let outcome = interp
            .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
            .unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].name, "error.execution");
        assert_eq!(queues.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_external_target_reports_communication_error() {
        let chart = chart(json!({
            "states": [
                {"id": "a", "transitions": [
                    {"event": "go", "target": "b",
                     "actions": [{"send": {"event": "x", "target": "http://nowhere"}}]}
                ]},
                {"id": "b"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(chart, &queues);
        interp.start(&mut queues).unwrap();

        let outcome = interp
            .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
            .unwrap();
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].name, "error.communication");
    }

    #[tokio::test]
    async fn test_determinism_across_runs() {
        let def = json!({
            "datamodel": {"count": 0},
            "states": [
                {"id": "p", "type": "parallel", "states": [
                    {"id": "r1", "initial": "a", "states": [
                        {"id": "a", "transitions": [{"event": "go", "target": "b",
                            "actions": [{"assign": {"location": "count", "expr": "ctx.count + 1"}}]}]},
                        {"id": "b"}
                    ]},
                    {"id": "r2", "initial": "c", "states": [
                        {"id": "c", "transitions": [{"event": "go", "target": "d",
                            "actions": [{"assign": {"location": "count", "expr": "ctx.count + 10"}}]}]},
                        {"id": "d"}
                    ]}
                ]}
            ]
        });
        let mut results = Vec::new();
        for _ in 0..3 {
            let chart = chart(def.clone());
            let mut queues = EventQueueSet::new();
            let mut interp = interp(chart, &queues);
            interp.start(&mut queues).unwrap();
            interp
                .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
                .unwrap();
            results.push((active(&interp), datamodel_ctx(&interp)));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[tokio::test]
    async fn test_capture_resume_round_trip() {
        let def = json!({
            "datamodel": {"count": 0},
            "initial": "work",
            "states": [
                {"id": "work", "initial": "one",
                 "transitions": [{"event": "pause", "target": "idle"}],
                 "states": [
                    {"id": "one", "transitions": [{"event": "next", "target": "two",
                        "actions": [{"assign": {"location": "count", "expr": "ctx.count + 1"}}]}]},
                    {"id": "two", "transitions": [{"event": "next", "target": "one",
                        "actions": [{"assign": {"location": "count", "expr": "ctx.count + 1"}}]}]},
                    {"id": "mem", "type": "history", "history": "shallow",
                     "transitions": [{"target": "one"}]}
                ]},
                {"id": "idle", "transitions": [{"event": "resume", "target": "mem"}]}
            ]
        });
        let chart = chart(def);
        let mut queues = EventQueueSet::new();
        let mut original = interp(Arc::clone(&chart), &queues);
        original.start(&mut queues).unwrap();
        for name in ["next", "pause"] {
            original
                .run_macrostep(&mut queues, Some(Event::external(name, Value::Null)))
                .unwrap();
        }
        let record = original.capture(&queues).unwrap();

        let mut restored_queues = EventQueueSet::new();
        let mut restored = Interpreter::resume(
            Arc::clone(&chart),
            record,
            Box::new(JsonDataModel::new()),
            Arc::new(NullServiceFactory),
            Arc::new(UnreachableIo),
            InterpreterConfig::default(),
            &mut restored_queues,
        )
        .unwrap();

        assert_eq!(active(&restored), active(&original));
        assert_eq!(datamodel_ctx(&restored), datamodel_ctx(&original));

        // Same subsequent behavior: resume restores history memory.
        for (interp, queues) in [
            (&mut original, &mut queues),
            (&mut restored, &mut restored_queues),
        ] {
            interp
                .run_macrostep(queues, Some(Event::external("resume", Value::Null)))
                .unwrap();
        }
        assert_eq!(active(&restored), active(&original));
        assert_eq!(active(&original), vec!["two", "work"]);
    }

    #[tokio::test]
    async fn test_resume_rejects_wrong_definition() {
        let chart_a = chart(json!({"states": [{"id": "a"}]}));
        let chart_b = chart(json!({"states": [{"id": "b"}]}));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(Arc::clone(&chart_a), &queues);
        interp.start(&mut queues).unwrap();
        let record = interp.capture(&queues).unwrap();

        let mut other_queues = EventQueueSet::new();
        let result = Interpreter::resume(
            chart_b,
            record,
            Box::new(JsonDataModel::new()),
            Arc::new(NullServiceFactory),
            Arc::new(UnreachableIo),
            InterpreterConfig::default(),
            &mut other_queues,
        );
        assert!(matches!(result, Err(InterpError::RecordMismatch { .. })));
    }

    #[tokio::test]
    async fn test_resume_rejects_version_bump() {
        // Identical definition JSON, so the checksums collide; only
        // the version distinguishes the two charts.
        let def = json!({"states": [{"id": "a"}]});
        let v1 = chart(def.clone());
        let v2 = Arc::new(StateChart::from_json("test", 2, &def).unwrap());
        assert_eq!(v1.checksum, v2.checksum);

        let mut queues = EventQueueSet::new();
        let mut interp = interp(v1, &queues);
        interp.start(&mut queues).unwrap();
        let record = interp.capture(&queues).unwrap();

        let mut other_queues = EventQueueSet::new();
        let result = Interpreter::resume(
            v2,
            record,
            Box::new(JsonDataModel::new()),
            Arc::new(NullServiceFactory),
            Arc::new(UnreachableIo),
            InterpreterConfig::default(),
            &mut other_queues,
        );
        assert!(matches!(result, Err(InterpError::RecordMismatch { .. })));
    }

    #[tokio::test]
    async fn test_legal_configuration_after_each_macrostep() {
        let chart = chart(json!({
            "states": [
                {"id": "p", "type": "parallel",
                 "transitions": [{"event": "out", "target": "solo"}],
                 "states": [
                    {"id": "r1", "initial": "a", "states": [
                        {"id": "a", "transitions": [{"event": "flip", "target": "b"}]},
                        {"id": "b", "transitions": [{"event": "flip", "target": "a"}]}
                    ]},
                    {"id": "r2", "initial": "c", "states": [{"id": "c"}]}
                ]},
                {"id": "solo", "transitions": [{"event": "back", "target": "p"}]}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = interp(Arc::clone(&chart), &queues);
        interp.start(&mut queues).unwrap();

        for name in ["flip", "out", "back", "flip"] {
            interp
                .run_macrostep(&mut queues, Some(Event::external(name, Value::Null)))
                .unwrap();
            interp
                .configuration()
                .validate(&chart, interp.session_id())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_microstep_snapshots_collected_when_enabled() {
        let chart = chart(json!({
            "datamodel": {"ready": true},
            "states": [
                {"id": "a", "transitions": [{"event": "go", "target": "b"}]},
                {"id": "b", "transitions": [{"cond": "ctx.ready", "target": "c"}]},
                {"id": "c"}
            ]
        }));
        let mut queues = EventQueueSet::new();
        let mut interp = Interpreter::new(
            chart,
            SessionId::generate(),
            Box::new(JsonDataModel::new()),
            Arc::new(NullServiceFactory),
            Arc::new(UnreachableIo),
            InterpreterConfig::default().with_snapshot_each_microstep(true),
            queues.handle(),
        );
        interp.start(&mut queues).unwrap();

        let outcome = interp
            .run_macrostep(&mut queues, Some(Event::external("go", Value::Null)))
            .unwrap();
        // One snapshot for a→b, one for the eventless b→c.
        assert_eq!(outcome.snapshots.len(), 2);
        assert_eq!(outcome.snapshots[1].status, "running");
    }

    proptest! {
        /// Any event sequence leaves the machine in a legal
        /// configuration, and replaying the same sequence reproduces
        /// the same configuration and data model.
        #[test]
        fn prop_event_sequences_deterministic(
            events in proptest::collection::vec(
                proptest::sample::select(vec!["go", "back", "toggle", "noise"]),
                0..24,
            )
        ) {
            let def = json!({
                "datamodel": {"count": 0},
                "states": [
                    {"id": "p", "type": "parallel", "states": [
                        {"id": "r1", "initial": "a", "states": [
                            {"id": "a", "transitions": [{"event": "go", "target": "b",
                                "actions": [{"assign": {"location": "count", "expr": "ctx.count + 1"}}]}]},
                            {"id": "b", "transitions": [{"event": "back", "target": "a"}]}
                        ]},
                        {"id": "r2", "initial": "c", "states": [
                            {"id": "c", "transitions": [{"event": "toggle", "target": "d"}]},
                            {"id": "d", "transitions": [{"event": "toggle", "target": "c"}]}
                        ]}
                    ]}
                ]
            });

            let run = |events: &[&str]| {
                let chart = chart(def.clone());
                let mut queues = EventQueueSet::new();
                let mut interp = interp(chart, &queues);
                interp.start(&mut queues).unwrap();
                for name in events {
                    interp
                        .run_macrostep(&mut queues, Some(Event::external(*name, Value::Null)))
                        .unwrap();
                }
                prop_assert_eq!(interp.status(), InterpreterStatus::Running);
                Ok((active(&interp), datamodel_ctx(&interp)))
            };

            let first = run(&events)?;
            let second = run(&events)?;
            prop_assert_eq!(first, second);
        }
    }
}
