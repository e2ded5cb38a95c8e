//! Child service invocation.
//!
//! `<invoke>`-style declarations start externally running services.
//! Starting is fire-and-forget from the step engine's point of view:
//! the child's emitted events come back later as ordinary external
//! events on the parent's queue, tagged with the invoke id as origin.

use crate::snapshot::InvokeSnapshot;
use dashmap::DashMap;
use serde_json::Value;
use statech_event::{EnqueueHandle, Event, InvokeId, SessionId};
use statech_tree::DocumentId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Errors from starting a child service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown service type: {type_uri}")]
    UnknownType { type_uri: String },

    #[error("service start failed: {reason}")]
    StartFailed { reason: String },
}

/// Everything a factory needs to start one child.
pub struct ServiceRequest {
    /// The parent instance.
    pub session_id: SessionId,

    /// Identity of this invocation.
    pub invoke_id: InvokeId,

    /// Service type URI from the invoke declaration.
    pub type_uri: String,

    /// Evaluated start payload.
    pub payload: Value,

    /// The child's only way to reach the parent.
    pub emitter: InvokeEmitter,
}

/// Control surface of a started child.
pub struct ServiceHandle {
    /// Forwarded/addressed events flow to the child through this
    /// sender. `None` for children that accept no input.
    pub to_child: Option<mpsc::UnboundedSender<Event>>,

    /// Fired once on cancel; dropped on natural completion.
    pub cancel: Option<oneshot::Sender<()>>,
}

/// Pluggable child-service construction, selected by type URI.
pub trait ServiceFactory: Send + Sync {
    fn start(&self, request: ServiceRequest) -> Result<ServiceHandle, ServiceError>;
}

/// Factory that knows no service types.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullServiceFactory;

impl ServiceFactory for NullServiceFactory {
    fn start(&self, request: ServiceRequest) -> Result<ServiceHandle, ServiceError> {
        Err(ServiceError::UnknownType {
            type_uri: request.type_uri,
        })
    }
}

/// Child-to-parent event path.
///
/// Events from a canceled invoke are dropped here, so a cancel that
/// races the child's own completion never delivers stale events after
/// the record is gone.
#[derive(Clone)]
pub struct InvokeEmitter {
    invoke_id: InvokeId,
    records: Arc<DashMap<InvokeId, InvokeRecord>>,
    parent: EnqueueHandle,
}

impl InvokeEmitter {
    /// Tags and enqueues an event on the parent's external queue.
    /// Returns false if the invoke was canceled or the parent is gone.
    pub fn emit(&self, event: Event) -> bool {
        if !self.records.contains_key(&self.invoke_id) {
            return false;
        }
        let event = event
            .with_invoke_id(self.invoke_id.clone())
            .with_origin(format!("#_{}", self.invoke_id));
        self.parent.enqueue(event).is_ok()
    }

    /// Emits the child's completion event.
    pub fn done(&self, data: Value) -> bool {
        let event = Event::done_invoke(&self.invoke_id, data);
        if !self.records.contains_key(&self.invoke_id) {
            return false;
        }
        self.parent
            .enqueue(event.with_origin(format!("#_{}", self.invoke_id)))
            .is_ok()
    }

    pub fn invoke_id(&self) -> &InvokeId {
        &self.invoke_id
    }
}

struct InvokeRecord {
    type_uri: String,
    autoforward: bool,
    payload: Value,
    /// State that declared the invoke; its exit cancels the child.
    owner: DocumentId,
    handle: Option<ServiceHandle>,
}

/// Starts, forwards to, and cancels the live children of one instance.
///
/// Owned by the instance; the records map is shared with emitters only
/// for liveness checks.
pub struct InvokeCoordinator {
    session_id: SessionId,
    records: Arc<DashMap<InvokeId, InvokeRecord>>,
    factory: Arc<dyn ServiceFactory>,
    parent: EnqueueHandle,
}

impl InvokeCoordinator {
    pub fn new(
        session_id: SessionId,
        factory: Arc<dyn ServiceFactory>,
        parent: EnqueueHandle,
    ) -> Self {
        Self {
            session_id,
            records: Arc::new(DashMap::new()),
            factory,
            parent,
        }
    }

    /// Starts a child. Must not block the owning macrostep; the
    /// factory spawns the actual work.
    pub fn start(
        &self,
        invoke_id: InvokeId,
        type_uri: &str,
        payload: Value,
        autoforward: bool,
        owner: DocumentId,
    ) -> Result<(), ServiceError> {
        // Record first so a child that emits immediately is live.
        self.records.insert(
            invoke_id.clone(),
            InvokeRecord {
                type_uri: type_uri.to_string(),
                autoforward,
                payload: payload.clone(),
                owner,
                handle: None,
            },
        );

        let request = ServiceRequest {
            session_id: self.session_id.clone(),
            invoke_id: invoke_id.clone(),
            type_uri: type_uri.to_string(),
            payload,
            emitter: InvokeEmitter {
                invoke_id: invoke_id.clone(),
                records: Arc::clone(&self.records),
                parent: self.parent.clone(),
            },
        };

        match self.factory.start(request) {
            Ok(handle) => {
                if let Some(mut record) = self.records.get_mut(&invoke_id) {
                    record.handle = Some(handle);
                }
                tracing::debug!(
                    session = %self.session_id,
                    invoke = %invoke_id,
                    type_uri,
                    "invoke started"
                );
                Ok(())
            }
            Err(e) => {
                self.records.remove(&invoke_id);
                Err(e)
            }
        }
    }

    /// Cancels a child. Idempotent: canceling twice, or after the
    /// child completed, is a no-op. Returns true if a live record was
    /// removed.
    pub fn cancel(&self, invoke_id: &InvokeId) -> bool {
        match self.records.remove(invoke_id) {
            Some((_, mut record)) => {
                if let Some(handle) = record.handle.take() {
                    if let Some(cancel) = handle.cancel {
                        // Child may already be gone; that's fine.
                        let _ = cancel.send(());
                    }
                }
                tracing::debug!(session = %self.session_id, invoke = %invoke_id, "invoke canceled");
                true
            }
            None => false,
        }
    }

    /// Cancels every child declared by the given state. Used on state
    /// exit.
    pub fn cancel_owned_by(&self, owner: DocumentId) {
        let owned: Vec<InvokeId> = self
            .records
            .iter()
            .filter(|e| e.value().owner == owner)
            .map(|e| e.key().clone())
            .collect();
        for id in owned {
            self.cancel(&id);
        }
    }

    /// Cancels every live child. Used on instance teardown.
    pub fn cancel_all(&self) {
        let ids: Vec<InvokeId> = self.records.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    /// Mirrors an external event into every autoforwarding child, in
    /// delivery order. Returns the invoke ids whose child could not be
    /// reached; the engine reports those as `error.communication`.
    pub fn forward(&self, event: &Event) -> Vec<InvokeId> {
        let mut failed = Vec::new();
        for entry in self.records.iter() {
            if !entry.value().autoforward {
                continue;
            }
            let reachable = entry
                .value()
                .handle
                .as_ref()
                .and_then(|h| h.to_child.as_ref())
                .map(|tx| tx.send(event.clone()).is_ok())
                .unwrap_or(false);
            if !reachable {
                failed.push(entry.key().clone());
            }
        }
        failed
    }

    /// Sends an event to one child addressed as `#_<invokeid>`.
    pub fn forward_to(&self, invoke_id: &InvokeId, event: Event) -> Result<(), ServiceError> {
        let entry = self
            .records
            .get(invoke_id)
            .ok_or_else(|| ServiceError::StartFailed {
                reason: format!("no such invoke: {invoke_id}"),
            })?;
        let tx = entry
            .value()
            .handle
            .as_ref()
            .and_then(|h| h.to_child.as_ref())
            .ok_or_else(|| ServiceError::StartFailed {
                reason: format!("invoke {invoke_id} accepts no input"),
            })?;
        tx.send(event).map_err(|_| ServiceError::StartFailed {
            reason: format!("invoke {invoke_id} is gone"),
        })
    }

    pub fn is_live(&self, invoke_id: &InvokeId) -> bool {
        self.records.contains_key(invoke_id)
    }

    pub fn live_count(&self) -> usize {
        self.records.len()
    }

    /// Captures live invokes for persistence.
    pub fn snapshot(&self) -> Vec<InvokeSnapshot> {
        self.records
            .iter()
            .map(|entry| InvokeSnapshot {
                invoke_id: entry.key().clone(),
                type_uri: entry.value().type_uri.clone(),
                autoforward: entry.value().autoforward,
                payload: entry.value().payload.clone(),
                owner: entry.value().owner,
            })
            .collect()
    }

    /// Restarts children from a snapshot. Returns the invoke ids that
    /// failed to restart.
    pub fn restore(&self, snapshots: Vec<InvokeSnapshot>) -> Vec<InvokeId> {
        let mut failed = Vec::new();
        for snap in snapshots {
            if self
                .start(
                    snap.invoke_id.clone(),
                    &snap.type_uri,
                    snap.payload,
                    snap.autoforward,
                    snap.owner,
                )
                .is_err()
            {
                failed.push(snap.invoke_id);
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statech_event::EventQueueSet;
    use std::sync::Mutex;

    /// Factory that records starts and lets tests drive the child.
    struct RecordingFactory {
        started: Mutex<Vec<(InvokeId, String)>>,
    }

    impl RecordingFactory {
        fn new() -> Self {
            Self {
                started: Mutex::new(Vec::new()),
            }
        }
    }

    impl ServiceFactory for RecordingFactory {
        fn start(&self, request: ServiceRequest) -> Result<ServiceHandle, ServiceError> {
            self.started
                .lock()
                .unwrap()
                .push((request.invoke_id.clone(), request.type_uri.clone()));
            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            let (cancel_tx, cancel_rx) = oneshot::channel();
            let emitter = request.emitter;
            tokio::spawn(async move {
                tokio::pin!(cancel_rx);
                loop {
                    tokio::select! {
                        _ = &mut cancel_rx => break,
                        event = rx.recv() => match event {
                            Some(event) => {
                                // Echo forwarded events back.
                                emitter.emit(Event::external(
                                    format!("child.echo.{}", event.name),
                                    event.data,
                                ));
                            }
                            None => break,
                        },
                    }
                }
            });
            Ok(ServiceHandle {
                to_child: Some(tx),
                cancel: Some(cancel_tx),
            })
        }
    }

    fn coordinator(queues: &EventQueueSet) -> (InvokeCoordinator, Arc<RecordingFactory>) {
        let factory = Arc::new(RecordingFactory::new());
        let coordinator = InvokeCoordinator::new(
            SessionId::generate(),
            factory.clone() as Arc<dyn ServiceFactory>,
            queues.handle(),
        );
        (coordinator, factory)
    }

    #[tokio::test]
    async fn test_start_and_emit() {
        let mut queues = EventQueueSet::new();
        let (coord, factory) = coordinator(&queues);
        let id = InvokeId::new("inv-1");
        coord
            .start(id.clone(), "mock", json!({}), true, DocumentId(1))
            .unwrap();
        assert!(coord.is_live(&id));
        assert_eq!(factory.started.lock().unwrap().len(), 1);

        coord.forward(&Event::external("ping", json!({"n": 1})));
        let echoed = queues.dequeue_next().await;
        assert_eq!(echoed.name, "child.echo.ping");
        assert_eq!(echoed.invoke_id, Some(id));
    }

    #[tokio::test]
    async fn test_autoforward_preserves_delivery_order() {
        let mut queues = EventQueueSet::new();
        let (coord, _factory) = coordinator(&queues);
        let id = InvokeId::new("inv-1");
        coord
            .start(id.clone(), "mock", json!({}), true, DocumentId(1))
            .unwrap();

        for n in 1..=3 {
            coord.forward(&Event::external("ping", json!({ "n": n })));
        }
        for n in 1..=3 {
            let echoed = queues.dequeue_next().await;
            assert_eq!(echoed.name, "child.echo.ping");
            assert_eq!(echoed.data, json!({ "n": n }));
        }
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let queues = EventQueueSet::new();
        let (coord, _factory) = coordinator(&queues);
        let id = InvokeId::new("inv-1");
        coord
            .start(id.clone(), "mock", json!({}), false, DocumentId(1))
            .unwrap();

        assert!(coord.cancel(&id));
        assert!(!coord.cancel(&id));
        assert!(!coord.cancel(&id));
        assert!(!coord.is_live(&id));
    }

    #[tokio::test]
    async fn test_canceled_invoke_events_dropped() {
        let mut queues = EventQueueSet::new();
        let (coord, _factory) = coordinator(&queues);
        let id = InvokeId::new("inv-1");
        coord
            .start(id.clone(), "mock", json!({}), true, DocumentId(1))
            .unwrap();
        coord.cancel(&id);

        // Forward after cancel reports the child as unreachable and
        // nothing arrives on the parent queue.
        let failed = coord.forward(&Event::external("ping", json!({})));
        assert!(failed.is_empty()); // no autoforward records remain
        tokio::task::yield_now().await;
        assert!(queues.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_fails() {
        let queues = EventQueueSet::new();
        let coord = InvokeCoordinator::new(
            SessionId::generate(),
            Arc::new(NullServiceFactory),
            queues.handle(),
        );
        let result = coord.start(
            InvokeId::new("inv-1"),
            "nope",
            json!({}),
            false,
            DocumentId(1),
        );
        assert!(matches!(result, Err(ServiceError::UnknownType { .. })));
        assert_eq!(coord.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_owned_by_state() {
        let queues = EventQueueSet::new();
        let (coord, _factory) = coordinator(&queues);
        coord
            .start(InvokeId::new("a"), "mock", json!({}), false, DocumentId(3))
            .unwrap();
        coord
            .start(InvokeId::new("b"), "mock", json!({}), false, DocumentId(4))
            .unwrap();

        coord.cancel_owned_by(DocumentId(3));
        assert!(!coord.is_live(&InvokeId::new("a")));
        assert!(coord.is_live(&InvokeId::new("b")));
    }

    #[tokio::test]
    async fn test_snapshot_shape() {
        let queues = EventQueueSet::new();
        let (coord, _factory) = coordinator(&queues);
        coord
            .start(
                InvokeId::new("a"),
                "mock",
                json!({"x": 1}),
                true,
                DocumentId(3),
            )
            .unwrap();

        let snaps = coord.snapshot();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].type_uri, "mock");
        assert!(snaps[0].autoforward);
        assert_eq!(snaps[0].owner, DocumentId(3));
    }
}
