//! HTTP API for branchline
//!
//! JSON endpoints over the conversation service, plus the two live
//! transports: Server-Sent Events (JSON) and WebSocket (MessagePack).

mod auth;
mod handlers;
mod sse;
mod types;
mod ws;

pub use handlers::create_router;

use crate::conversation::{ConversationService, DatabaseRepository};
use std::sync::Arc;
use std::time::Duration;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ConversationService<DatabaseRepository>>,
    /// Interval for SSE keepalive comments and WebSocket pings
    pub keepalive: Duration,
}

impl AppState {
    pub fn new(service: ConversationService<DatabaseRepository>, keepalive: Duration) -> Self {
        Self {
            service: Arc::new(service),
            keepalive,
        }
    }
}
