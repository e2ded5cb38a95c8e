//! The instance scheduler.
//!
//! One tokio task per instance: the task starts the interpreter, then
//! parks on the queue pair until the next event, a shutdown signal, or
//! completion. Destroying an instance signals its task and waits for
//! the in-flight macrostep to reach its suspension point before
//! tearing down, so a destroyed instance never leaves a half-exited
//! configuration behind.

use crate::config::HostConfig;
use crate::error::HostError;
use dashmap::DashMap;
use serde_json::Value;
use statech_event::{
    EnqueueHandle, Event, EventQueueSet, IoError, IoProcessor, OutgoingEvent, SendDisposition,
    SessionId,
};
use statech_interp::{
    DoneEvent, InterpError, Interpreter, InterpreterConfig, InterpreterStatus, JsonDataModel,
    MacrostepOutcome, ServiceFactory,
};
use statech_persist::{SnapshotPolicy, SnapshotStore};
use statech_tree::StateChart;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Session address prefix used for inter-instance sends.
const SESSION_TARGET_PREFIX: &str = "#_scxml_";

/// How an instance task ended.
#[derive(Debug)]
pub enum InstanceReport {
    /// The machine reached a top-level final state.
    Completed(DoneEvent),
    /// The host destroyed the instance.
    Destroyed,
    /// A fatal interpreter error stopped the instance.
    Failed { code: String, reason: String },
}

/// Routes `#_scxml_<sessionid>` sends onto the addressed instance's
/// external queue. Every other target is unreachable; wiring a real
/// transport means wrapping this router with one that handles the
/// remaining targets.
struct SessionRouter {
    routes: Arc<DashMap<SessionId, EnqueueHandle>>,
}

impl IoProcessor for SessionRouter {
    fn try_send(&self, outgoing: OutgoingEvent) -> Result<SendDisposition, IoError> {
        let Some(raw) = outgoing.target.strip_prefix(SESSION_TARGET_PREFIX) else {
            return Err(IoError::Unreachable {
                target: outgoing.target,
            });
        };
        let session_id = SessionId::new(raw);
        let Some(handle) = self.routes.get(&session_id) else {
            return Err(IoError::Unreachable {
                target: outgoing.target,
            });
        };
        handle
            .enqueue(outgoing.event)
            .map_err(|_| IoError::Rejected {
                reason: format!("session {session_id} is gone"),
            })?;
        Ok(SendDisposition::QueuedInternally)
    }
}

struct InstanceHandle {
    enqueue: EnqueueHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<InstanceReport>,
}

/// Runs many instances, each on its own task, over shared chart
/// definitions.
pub struct Host {
    config: HostConfig,
    charts: DashMap<String, Arc<StateChart>>,
    sessions: DashMap<SessionId, InstanceHandle>,
    routes: Arc<DashMap<SessionId, EnqueueHandle>>,
    store: Option<Arc<SnapshotStore>>,
    factory: Arc<dyn ServiceFactory>,
}

impl Host {
    /// Builds a host. The snapshot store is opened now when the
    /// config's snapshot policy requires one.
    pub fn new(config: HostConfig, factory: Arc<dyn ServiceFactory>) -> Result<Self, HostError> {
        let store = match (config.snapshot.policy, &config.snapshot.dir) {
            (SnapshotPolicy::Off, None) => None,
            (_, Some(dir)) => Some(Arc::new(SnapshotStore::open(dir)?)),
            (_, None) => return Err(HostError::PersistenceDisabled),
        };
        Ok(Self {
            config,
            charts: DashMap::new(),
            sessions: DashMap::new(),
            routes: Arc::new(DashMap::new()),
            store,
            factory,
        })
    }

    /// Parses, validates and registers a chart definition under its
    /// name, replacing any previous version.
    pub fn register_chart(
        &self,
        name: &str,
        version: u32,
        definition: &Value,
    ) -> Result<Arc<StateChart>, HostError> {
        let chart = Arc::new(StateChart::from_json(name, version, definition)?);
        self.charts.insert(name.to_string(), Arc::clone(&chart));
        tracing::info!(chart = name, version, checksum = %chart.checksum, "chart registered");
        Ok(chart)
    }

    pub fn chart(&self, name: &str) -> Option<Arc<StateChart>> {
        self.charts.get(name).map(|c| Arc::clone(&c))
    }

    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Starts a fresh instance of a registered chart.
    pub fn spawn(&self, chart_name: &str) -> Result<SessionId, HostError> {
        let chart = self
            .charts
            .get(chart_name)
            .map(|c| Arc::clone(&c))
            .ok_or_else(|| HostError::ChartNotFound(chart_name.to_string()))?;

        let session_id = SessionId::generate();
        let queues = EventQueueSet::new();
        let interp = Interpreter::new(
            chart,
            session_id.clone(),
            Box::new(JsonDataModel::new()),
            Arc::clone(&self.factory),
            Arc::new(SessionRouter {
                routes: Arc::clone(&self.routes),
            }),
            self.interp_config(),
            queues.handle(),
        );
        self.launch(session_id.clone(), interp, queues, true);
        Ok(session_id)
    }

    /// Resumes a persisted instance from the snapshot store.
    pub fn restore(&self, session_id: &SessionId) -> Result<(), HostError> {
        let store = self.store.as_ref().ok_or(HostError::PersistenceDisabled)?;
        let record = store.load(session_id)?;
        let chart = self
            .charts
            .get(&record.chart_name)
            .map(|c| Arc::clone(&c))
            .ok_or_else(|| HostError::ChartNotFound(record.chart_name.clone()))?;

        let mut queues = EventQueueSet::new();
        let interp = Interpreter::resume(
            chart,
            record,
            Box::new(JsonDataModel::new()),
            Arc::clone(&self.factory),
            Arc::new(SessionRouter {
                routes: Arc::clone(&self.routes),
            }),
            self.interp_config(),
            &mut queues,
        )?;
        if interp.status() != InterpreterStatus::Running {
            return Err(HostError::Interp(InterpError::RecordMismatch {
                reason: format!("instance is {}, not resumable", interp.status()),
            }));
        }
        self.launch(session_id.clone(), interp, queues, false);
        Ok(())
    }

    /// Delivers an external event to a running instance.
    pub fn dispatch(&self, session_id: &SessionId, event: Event) -> Result<(), HostError> {
        let handle = self
            .sessions
            .get(session_id)
            .ok_or_else(|| HostError::SessionNotFound(session_id.clone()))?;
        handle.enqueue.enqueue(event)?;
        Ok(())
    }

    /// Signals an instance to stop and waits for its task to finish.
    /// Pending delayed sends and live invokes are canceled before the
    /// task exits.
    pub async fn destroy(&self, session_id: &SessionId) -> Result<InstanceReport, HostError> {
        let (_, handle) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| HostError::SessionNotFound(session_id.clone()))?;
        let _ = handle.shutdown.send(true);
        handle.task.await.map_err(|_| HostError::TaskPanicked)
    }

    /// Waits for an instance to end on its own (completion or failure).
    pub async fn wait(&self, session_id: &SessionId) -> Result<InstanceReport, HostError> {
        let (_, handle) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| HostError::SessionNotFound(session_id.clone()))?;
        handle.task.await.map_err(|_| HostError::TaskPanicked)
    }

    /// Destroys every running instance.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.destroy(&id).await;
        }
    }

    fn interp_config(&self) -> InterpreterConfig {
        InterpreterConfig::default()
            .with_max_iterations(self.config.interp.max_iterations)
            .with_snapshot_each_microstep(
                self.config.snapshot.policy == SnapshotPolicy::PerMicrostep,
            )
    }

    fn launch(
        &self,
        session_id: SessionId,
        interp: Interpreter,
        queues: EventQueueSet,
        fresh: bool,
    ) {
        let enqueue = queues.handle();
        self.routes.insert(session_id.clone(), enqueue.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = self.store.clone();
        let policy = self.config.snapshot.policy;
        let routes = Arc::clone(&self.routes);
        let task_session = session_id.clone();
        let task = tokio::spawn(async move {
            let report = run_instance(interp, queues, shutdown_rx, store, policy, fresh).await;
            routes.remove(&task_session);
            tracing::debug!(session = %task_session, ?report, "instance task finished");
            report
        });
        self.sessions.insert(
            session_id,
            InstanceHandle {
                enqueue,
                shutdown: shutdown_tx,
                task,
            },
        );
    }
}

/// The per-instance event loop.
async fn run_instance(
    mut interp: Interpreter,
    mut queues: EventQueueSet,
    mut shutdown: watch::Receiver<bool>,
    store: Option<Arc<SnapshotStore>>,
    policy: SnapshotPolicy,
    fresh: bool,
) -> InstanceReport {
    if fresh {
        match interp.start(&mut queues) {
            Ok(outcome) => {
                persist(&store, policy, &interp, &queues, &outcome);
                if let Some(done) = outcome.done {
                    return InstanceReport::Completed(done);
                }
            }
            Err(e) => return failed(e),
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if policy != SnapshotPolicy::Off {
                    save_capture(&store, &interp, &queues);
                }
                interp.teardown(&queues);
                return InstanceReport::Destroyed;
            }
            event = queues.dequeue_next() => {
                match interp.run_macrostep(&mut queues, Some(event)) {
                    Ok(outcome) => {
                        persist(&store, policy, &interp, &queues, &outcome);
                        if let Some(done) = outcome.done {
                            return InstanceReport::Completed(done);
                        }
                    }
                    Err(e) => {
                        interp.teardown(&queues);
                        return failed(e);
                    }
                }
            }
        }
    }
}

fn failed(e: InterpError) -> InstanceReport {
    InstanceReport::Failed {
        code: e.code().to_string(),
        reason: e.to_string(),
    }
}

/// Applies the snapshot policy after one macrostep. Persistence
/// failures are logged, never fatal to the instance.
fn persist(
    store: &Option<Arc<SnapshotStore>>,
    policy: SnapshotPolicy,
    interp: &Interpreter,
    queues: &EventQueueSet,
    outcome: &MacrostepOutcome,
) {
    if policy == SnapshotPolicy::Off {
        return;
    }
    let Some(store) = store else {
        return;
    };
    for record in &outcome.snapshots {
        if let Err(e) = store.save(record) {
            tracing::warn!(session = %record.session_id, %e, "microstep snapshot failed");
        }
    }
    save_capture(&Some(Arc::clone(store)), interp, queues);
}

fn save_capture(store: &Option<Arc<SnapshotStore>>, interp: &Interpreter, queues: &EventQueueSet) {
    let Some(store) = store else {
        return;
    };
    match interp.capture(queues) {
        Ok(record) => {
            if let Err(e) = store.save(&record) {
                tracing::warn!(session = %interp.session_id(), %e, "snapshot save failed");
            }
        }
        Err(e) => {
            tracing::warn!(session = %interp.session_id(), %e, "snapshot capture failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statech_interp::NullServiceFactory;
    use tempfile::TempDir;

    fn host() -> Host {
        Host::new(HostConfig::default(), Arc::new(NullServiceFactory)).unwrap()
    }

    fn persistent_host(dir: &TempDir) -> Host {
        let mut config = HostConfig::default();
        config.snapshot.policy = SnapshotPolicy::PerMacrostep;
        config.snapshot.dir = Some(dir.path().to_path_buf());
        Host::new(config, Arc::new(NullServiceFactory)).unwrap()
    }

    fn counter_chart() -> Value {
        json!({
            "datamodel": {"count": 0},
            "states": [
                {"id": "counting", "transitions": [
                    {"event": "tick", "target": "counting",
                     "actions": [{"assign": {"location": "count", "expr": "ctx.count + 1"}}]},
                    {"event": "stop", "target": "end"}
                ]},
                {"id": "end", "type": "final", "donedata": {"expr": "ctx.count"}}
            ]
        })
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_spawn_dispatch_complete() {
        let host = host();
        host.register_chart("counter", 1, &counter_chart()).unwrap();
        let sid = host.spawn("counter").unwrap();
        assert!(host.is_running(&sid));

        for _ in 0..3 {
            host.dispatch(&sid, Event::external("tick", Value::Null)).unwrap();
        }
        host.dispatch(&sid, Event::external("stop", Value::Null)).unwrap();

        let report = host.wait(&sid).await.unwrap();
        match report {
            InstanceReport::Completed(done) => {
                assert_eq!(done.final_state, "end");
                assert_eq!(done.data, json!(3));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(host.session_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_stops_instance() {
        let host = host();
        host.register_chart("counter", 1, &counter_chart()).unwrap();
        let sid = host.spawn("counter").unwrap();
        settle().await;

        let report = host.destroy(&sid).await.unwrap();
        assert!(matches!(report, InstanceReport::Destroyed));
        assert!(!host.is_running(&sid));

        // Further dispatch fails.
        let err = host.dispatch(&sid, Event::external("tick", Value::Null));
        assert!(matches!(err, Err(HostError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_spawn_unknown_chart_fails() {
        let host = host();
        assert!(matches!(
            host.spawn("ghost"),
            Err(HostError::ChartNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_machine_reports_failure() {
        let host = host();
        host.register_chart(
            "looping",
            1,
            &json!({
                "states": [
                    {"id": "a", "transitions": [{"target": "b"}]},
                    {"id": "b", "transitions": [{"target": "a"}]}
                ]
            }),
        )
        .unwrap();
        let sid = host.spawn("looping").unwrap();

        let report = host.wait(&sid).await.unwrap();
        match report {
            InstanceReport::Failed { code, .. } => assert_eq!(code, "MALFORMED_MACHINE"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_router_targets() {
        let routes: Arc<DashMap<SessionId, EnqueueHandle>> = Arc::new(DashMap::new());
        let mut queues = EventQueueSet::new();
        let sid = SessionId::new("s-1");
        routes.insert(sid.clone(), queues.handle());
        let router = SessionRouter {
            routes: Arc::clone(&routes),
        };

        let delivered = router.try_send(OutgoingEvent {
            target: "#_scxml_s-1".to_string(),
            event: Event::external("ping", Value::Null),
        });
        assert!(matches!(delivered, Ok(SendDisposition::QueuedInternally)));
        assert_eq!(queues.dequeue_next().await.name, "ping");

        let missing = router.try_send(OutgoingEvent {
            target: "#_scxml_s-2".to_string(),
            event: Event::external("ping", Value::Null),
        });
        assert!(matches!(missing, Err(IoError::Unreachable { .. })));

        let external = router.try_send(OutgoingEvent {
            target: "http://elsewhere".to_string(),
            event: Event::external("ping", Value::Null),
        });
        assert!(matches!(external, Err(IoError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_persist_destroy_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let host = persistent_host(&dir);
        host.register_chart("counter", 1, &counter_chart()).unwrap();
        let sid = host.spawn("counter").unwrap();

        host.dispatch(&sid, Event::external("tick", Value::Null)).unwrap();
        host.dispatch(&sid, Event::external("tick", Value::Null)).unwrap();
        settle().await;
        host.destroy(&sid).await.unwrap();
        assert_eq!(host.store().unwrap().count(), 1);

        host.restore(&sid).unwrap();
        assert!(host.is_running(&sid));
        host.dispatch(&sid, Event::external("tick", Value::Null)).unwrap();
        host.dispatch(&sid, Event::external("stop", Value::Null)).unwrap();

        let report = host.wait(&sid).await.unwrap();
        match report {
            InstanceReport::Completed(done) => assert_eq!(done.data, json!(3)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_without_store_fails() {
        let host = host();
        let err = host.restore(&SessionId::new("s-1"));
        assert!(matches!(err, Err(HostError::PersistenceDisabled)));
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let host = host();
        host.register_chart("counter", 1, &counter_chart()).unwrap();
        for _ in 0..3 {
            host.spawn("counter").unwrap();
        }
        settle().await;
        assert_eq!(host.session_count(), 3);

        host.shutdown().await;
        assert_eq!(host.session_count(), 0);
    }
}
