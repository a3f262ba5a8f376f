//! Periodic eviction of idle sessions, channels and queued events.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::state::GatewayState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: Duration,
    pub session_ttl: Duration,
    pub connection_ttl: Duration,
}

impl SweepSettings {
    pub fn from_state(state: &GatewayState) -> Self {
        Self {
            interval: Duration::from_secs(state.config.sweep_interval_secs()),
            session_ttl: Duration::from_secs(state.config.session_ttl_secs()),
            connection_ttl: Duration::from_secs(state.config.connection_ttl_secs()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub connections: usize,
    pub events: usize,
}

/// One eviction pass. Queued events share the session TTL.
pub async fn sweep_once(state: &GatewayState, settings: SweepSettings) -> SweepReport {
    let report = SweepReport {
        sessions: state.sessions.cleanup(settings.session_ttl).await,
        connections: state.connections.cleanup(settings.connection_ttl).await,
        events: state.queue.cleanup(settings.session_ttl).await,
    };
    if report != SweepReport::default() {
        info!(
            sessions = report.sessions,
            connections = report.connections,
            events = report.events,
            "Sweep evicted stale entries"
        );
    } else {
        debug!("Sweep found nothing to evict");
    }
    report
}

/// Run [`sweep_once`] every `settings.interval` until the task is aborted.
pub fn spawn_sweeper(state: Arc<GatewayState>, settings: SweepSettings) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval_at(Instant::now() + settings.interval, settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep_once(&state, settings).await;
        }
    })
}
