//! Conversation history keyed by thread id.

use std::collections::HashMap;
use std::time::Duration;

use agent_relay_core::run::Message;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub last_activity: Instant,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            messages: Vec::new(),
            last_activity: Instant::now(),
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a session, creating it on first reference. Touches it either way.
    pub async fn get_or_create(&self, id: &str) -> Session {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(id.to_string()).or_insert_with(|| {
            debug!(session_id = id, "Session created");
            Session::new(id)
        });
        session.last_activity = Instant::now();
        session.clone()
    }

    /// Append a run's messages. No deduplication: clients resending full
    /// history grow it every run.
    pub async fn update_messages(&self, id: &str, messages: Vec<Message>) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id));
        session.messages.extend(messages);
        session.last_activity = Instant::now();
    }

    pub async fn history(&self, id: &str) -> Vec<Message> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Drop sessions idle longer than `max_age`. Returns how many were removed.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.last_activity.elapsed() <= max_age);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
