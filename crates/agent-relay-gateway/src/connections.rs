//! Live event channels, at most one per session.
//!
//! Opening a second channel for a session replaces the first: the old sink
//! is dropped, which ends the old response stream. Every channel gets a
//! heartbeat task; a failed write through either path evicts the channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_relay_core::protocol::Event;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encoder::FrameFormat;
use crate::queue::EventQueue;

struct Connection {
    conn_id: String,
    tx: UnboundedSender<Bytes>,
    format: FrameFormat,
    last_activity: Instant,
    heartbeat: AbortHandle,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

type ConnectionMap = Arc<RwLock<HashMap<String, Connection>>>;

/// Identity of a freshly registered channel.
pub struct ConnectionHandle {
    pub session_id: String,
    pub conn_id: String,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: ConnectionMap,
    heartbeat_interval: Duration,
}

impl ConnectionRegistry {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            heartbeat_interval,
        }
    }

    /// Open a channel for `session_id`, replacing any existing one.
    pub async fn register(
        &self,
        session_id: &str,
        format: FrameFormat,
    ) -> (ConnectionHandle, UnboundedReceiver<Bytes>) {
        let (tx, rx) = unbounded_channel();
        let mut connections = self.connections.write().await;
        let handle = self.insert_locked(&mut connections, session_id, format, tx);
        (handle, rx)
    }

    /// Open a channel that starts with `preamble` followed by the session's
    /// queued backlog. The registry lock is held from the dequeue until the
    /// channel is visible, so no live event can overtake the backlog.
    /// Returns the number of queued events flushed.
    pub async fn open(
        &self,
        session_id: &str,
        format: FrameFormat,
        preamble: Option<Bytes>,
        queue: &EventQueue,
    ) -> (ConnectionHandle, UnboundedReceiver<Bytes>, usize) {
        let (tx, rx) = unbounded_channel();
        if let Some(frame) = preamble {
            let _ = tx.send(frame);
        }

        let mut connections = self.connections.write().await;
        let backlog = queue.dequeue_all(session_id).await;
        let flushed = backlog.len();
        if flushed > 0 {
            info!(session_id, events = flushed, "Flushing queued events");
        }
        for event in backlog {
            match format.encode(&event) {
                Ok(frame) => {
                    let _ = tx.send(frame);
                }
                Err(e) => warn!(session_id, %e, "Dropping unencodable queued event"),
            }
        }

        let handle = self.insert_locked(&mut connections, session_id, format, tx);
        (handle, rx, flushed)
    }

    fn insert_locked(
        &self,
        connections: &mut HashMap<String, Connection>,
        session_id: &str,
        format: FrameFormat,
        tx: UnboundedSender<Bytes>,
    ) -> ConnectionHandle {
        let conn_id = Uuid::new_v4().to_string();

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.connections.clone(),
            session_id.to_string(),
            conn_id.clone(),
            self.heartbeat_interval,
        ))
        .abort_handle();

        let connection = Connection {
            conn_id: conn_id.clone(),
            tx,
            format,
            last_activity: Instant::now(),
            heartbeat,
        };

        if let Some(previous) = connections.insert(session_id.to_string(), connection) {
            info!(session_id, replaced = %previous.conn_id, "Replaced existing event channel");
        } else {
            info!(session_id, conn_id = %conn_id, "Event channel opened");
        }
        #[cfg(feature = "metrics")]
        crate::metrics::set_active_connections(connections.len());

        ConnectionHandle {
            session_id: session_id.to_string(),
            conn_id,
        }
    }

    /// Write one event to the session's channel. On a failed write the
    /// channel is evicted and false returned.
    pub async fn send_event(&self, session_id: &str, event: &Event) -> bool {
        let mut connections = self.connections.write().await;
        write_locked(&mut connections, session_id, event)
    }

    /// Write one event to the session's channel, or queue it when there is
    /// no channel or the write fails. Queuing happens under the registry
    /// lock so it cannot interleave with [`ConnectionRegistry::open`].
    /// Returns true when the event was written.
    pub async fn send_or_queue(&self, session_id: &str, event: Event, queue: &EventQueue) -> bool {
        let mut connections = self.connections.write().await;
        if write_locked(&mut connections, session_id, &event) {
            return true;
        }
        queue.enqueue(session_id, event).await;
        false
    }

    pub async fn has_connection(&self, session_id: &str) -> bool {
        self.connections.read().await.contains_key(session_id)
    }

    pub async fn unregister(&self, session_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(session_id).is_some();
        if removed {
            info!(session_id, "Event channel closed");
            #[cfg(feature = "metrics")]
            crate::metrics::set_active_connections(connections.len());
        }
        removed
    }

    /// Unregister only if the session's channel is still `conn_id`, so a
    /// replaced channel cannot remove its successor.
    pub async fn unregister_if(&self, session_id: &str, conn_id: &str) -> bool {
        remove_if(&self.connections, session_id, conn_id).await
    }

    /// Evict channels idle longer than `max_age`. Returns how many were removed.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|_, c| c.last_activity.elapsed() <= max_age);
        let removed = before - connections.len();
        #[cfg(feature = "metrics")]
        {
            crate::metrics::set_active_connections(connections.len());
            if removed > 0 {
                crate::metrics::record_eviction("idle");
            }
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Guard that unregisters the channel when dropped, typically owned by
    /// the response body.
    pub fn guard(&self, handle: &ConnectionHandle) -> ConnectionGuard {
        ConnectionGuard {
            registry: self.clone(),
            session_id: handle.session_id.clone(),
            conn_id: handle.conn_id.clone(),
        }
    }
}

fn write_locked(
    connections: &mut HashMap<String, Connection>,
    session_id: &str,
    event: &Event,
) -> bool {
    let Some(connection) = connections.get_mut(session_id) else {
        return false;
    };

    let frame = match connection.format.encode(event) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session_id, %e, "Failed to encode event");
            return false;
        }
    };

    if connection.tx.send(frame).is_ok() {
        connection.last_activity = Instant::now();
        return true;
    }

    warn!(session_id, conn_id = %connection.conn_id, "Event channel write failed, evicting");
    connections.remove(session_id);
    #[cfg(feature = "metrics")]
    {
        crate::metrics::set_active_connections(connections.len());
        crate::metrics::record_eviction("write_failed");
    }
    false
}

async fn remove_if(connections: &ConnectionMap, session_id: &str, conn_id: &str) -> bool {
    let mut connections = connections.write().await;
    if !connections
        .get(session_id)
        .is_some_and(|c| c.conn_id == conn_id)
    {
        return false;
    }
    connections.remove(session_id);
    info!(session_id, conn_id, "Event channel closed");
    #[cfg(feature = "metrics")]
    crate::metrics::set_active_connections(connections.len());
    true
}

async fn heartbeat_loop(
    connections: ConnectionMap,
    session_id: String,
    conn_id: String,
    period: Duration,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;

        let mut guard = connections.write().await;
        let Some(connection) = guard
            .get_mut(&session_id)
            .filter(|c| c.conn_id == conn_id)
        else {
            return;
        };

        if connection.tx.send(connection.format.heartbeat()).is_ok() {
            connection.last_activity = Instant::now();
            debug!(session_id = %session_id, "Heartbeat sent");
            continue;
        }

        warn!(session_id = %session_id, conn_id = %conn_id, "Heartbeat write failed, evicting");
        guard.remove(&session_id);
        #[cfg(feature = "metrics")]
        {
            crate::metrics::set_active_connections(guard.len());
            crate::metrics::record_eviction("heartbeat_failed");
        }
        return;
    }
}

/// Unregisters its channel on drop.
pub struct ConnectionGuard {
    registry: ConnectionRegistry,
    session_id: String,
    conn_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let registry = self.registry.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let conn_id = std::mem::take(&mut self.conn_id);
        runtime.spawn(async move {
            registry.unregister_if(&session_id, &conn_id).await;
        });
    }
}
