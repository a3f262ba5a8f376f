//! HTTP gateway between clients and the agent runtime.
//!
//! Runs are posted to `/agent` and their events streamed back, either as the
//! response body or over a long-lived `/events` channel keyed by session.
//! Events that cannot be written to a channel are queued and flushed, in
//! order, when the session reconnects.

pub mod connections;
pub mod encoder;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod queue;
pub mod router;
pub mod scenarios;
pub mod server;
pub mod sessions;
pub mod state;
pub mod sweep;

pub use server::{build_router, serve, start_gateway};
pub use state::GatewayState;
