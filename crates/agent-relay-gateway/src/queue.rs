//! Per-session backlog of events that could not be delivered.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use agent_relay_core::protocol::Event;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event: Event,
    pub enqueued_at: Instant,
}

/// FIFO per session, capped at `capacity` entries. When full the oldest
/// entry is dropped.
pub struct EventQueue {
    queues: Mutex<HashMap<String, VecDeque<QueuedEvent>>>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns true when an older event had to be dropped to make room.
    pub async fn enqueue(&self, session_id: &str, event: Event) -> bool {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(session_id.to_string()).or_default();

        let mut dropped = false;
        if queue.len() >= self.capacity {
            queue.pop_front();
            dropped = true;
            warn!(session_id, capacity = self.capacity, "Event queue full, dropped oldest event");
            #[cfg(feature = "metrics")]
            crate::metrics::record_eviction("queue_overflow");
        }
        queue.push_back(QueuedEvent {
            event,
            enqueued_at: Instant::now(),
        });
        dropped
    }

    /// Take every queued event for a session, oldest first.
    pub async fn dequeue_all(&self, session_id: &str) -> Vec<Event> {
        self.queues
            .lock()
            .await
            .remove(session_id)
            .map(|q| q.into_iter().map(|e| e.event).collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, session_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(session_id)
            .map_or(0, VecDeque::len)
    }

    /// Events queued across all sessions.
    pub async fn total(&self) -> usize {
        self.queues.lock().await.values().map(VecDeque::len).sum()
    }

    /// Drop events older than `max_age`. Returns how many were removed.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let mut queues = self.queues.lock().await;
        let mut removed = 0;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|e| e.enqueued_at.elapsed() <= max_age);
            removed += before - queue.len();
        }
        queues.retain(|_, q| !q.is_empty());
        removed
    }
}
