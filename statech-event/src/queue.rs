//! Per-instance event queues.
//!
//! Each instance owns one internal FIFO and one external queue. The
//! internal queue is drained completely before the external queue is
//! consulted, so internal events always win. External producers
//! (timers, invoked children, transports) only ever touch the instance
//! through a cloned [`EnqueueHandle`].

use crate::error::EventError;
use crate::event::Event;
use crate::ids::SendId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Thread-safe producer side of an instance's external queue.
#[derive(Debug, Clone)]
pub struct EnqueueHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EnqueueHandle {
    /// Enqueues an external event. Fails only after the instance is gone.
    pub fn enqueue(&self, event: Event) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::QueueClosed)
    }
}

/// A delayed send captured for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSendRecord {
    pub send_id: SendId,
    pub event: Event,
    pub remaining_ms: u64,
}

struct PendingSend {
    event: Event,
    deliver_at: Instant,
    abort: AbortHandle,
}

/// The internal/external queue pair of one instance.
pub struct EventQueueSet {
    internal: VecDeque<Event>,
    external_tx: mpsc::UnboundedSender<Event>,
    external_rx: mpsc::UnboundedReceiver<Event>,
    pending: Arc<DashMap<SendId, PendingSend>>,
}

impl EventQueueSet {
    pub fn new() -> Self {
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        Self {
            internal: VecDeque::new(),
            external_tx,
            external_rx,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// A clonable handle for external producers.
    pub fn handle(&self) -> EnqueueHandle {
        EnqueueHandle {
            tx: self.external_tx.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Internal queue (same-task only)
    // -------------------------------------------------------------------------

    pub fn push_internal(&mut self, event: Event) {
        self.internal.push_back(event);
    }

    pub fn pop_internal(&mut self) -> Option<Event> {
        self.internal.pop_front()
    }

    pub fn has_internal(&self) -> bool {
        !self.internal.is_empty()
    }

    // -------------------------------------------------------------------------
    // External queue
    // -------------------------------------------------------------------------

    /// Immediate external enqueue from the owning task.
    pub fn enqueue_external(&self, event: Event) {
        // We hold the receiver, so the channel cannot be closed.
        let _ = self.external_tx.send(event);
    }

    /// Waits for the next event, internal queue first. The only
    /// blocking point in the core.
    pub async fn dequeue_next(&mut self) -> Event {
        if let Some(event) = self.internal.pop_front() {
            return event;
        }
        match self.external_rx.recv().await {
            Some(event) => event,
            // Unreachable while we hold a sender; park rather than panic.
            None => std::future::pending().await,
        }
    }

    /// Non-blocking dequeue, internal queue first.
    pub fn try_dequeue(&mut self) -> Option<Event> {
        if let Some(event) = self.internal.pop_front() {
            return Some(event);
        }
        self.external_rx.try_recv().ok()
    }

    // -------------------------------------------------------------------------
    // Delayed sends
    // -------------------------------------------------------------------------

    /// Schedules a delayed delivery onto the external queue. The timer
    /// removes itself from the pending registry before delivering, so a
    /// cancel that loses the race is a clean no-op.
    pub fn schedule_send(&self, send_id: SendId, event: Event, delay: Duration) {
        let tx = self.external_tx.clone();
        let pending = Arc::clone(&self.pending);
        let task_id = send_id.clone();
        let task_event = event.clone();
        // Anchor the deadline at schedule time so it matches the recorded
        // `deliver_at`, regardless of when the spawned task is first polled.
        let deliver_at = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deliver_at).await;
            if pending.remove(&task_id).is_some() {
                let _ = tx.send(task_event);
            }
        });
        tracing::debug!(send_id = %send_id, delay_ms = delay.as_millis() as u64, "send scheduled");
        self.pending.insert(
            send_id,
            PendingSend {
                event,
                deliver_at,
                abort: handle.abort_handle(),
            },
        );
    }

    /// Cancels a still-pending send. Returns false (not an error) when
    /// the send was already delivered or never existed.
    pub fn cancel_send(&self, send_id: &SendId) -> bool {
        match self.pending.remove(send_id) {
            Some((_, p)) => {
                p.abort.abort();
                tracing::debug!(send_id = %send_id, "pending send canceled");
                true
            }
            None => false,
        }
    }

    /// Cancels every pending delayed send. Used on instance teardown.
    pub fn cancel_all_pending(&self) {
        let ids: Vec<SendId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel_send(&id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Captures pending sends with their remaining delays for a
    /// persistence snapshot.
    pub fn pending_sends(&self) -> Vec<PendingSendRecord> {
        let now = Instant::now();
        self.pending
            .iter()
            .map(|entry| PendingSendRecord {
                send_id: entry.key().clone(),
                event: entry.value().event.clone(),
                remaining_ms: entry
                    .value()
                    .deliver_at
                    .saturating_duration_since(now)
                    .as_millis() as u64,
            })
            .collect()
    }

    /// Reschedules sends captured by a snapshot.
    pub fn restore_pending(&self, records: Vec<PendingSendRecord>) {
        for record in records {
            self.schedule_send(
                record.send_id,
                record.event,
                Duration::from_millis(record.remaining_ms),
            );
        }
    }
}

impl Default for EventQueueSet {
    fn default() -> Self {
        Self::new()
    }
}
