//! Relay event bus: typed progress and lifecycle events.
//!
//! The bus is a `tokio::sync::broadcast` channel carrying [`RelayEvent`]
//! values. Any consumer (SSE endpoint, log sink, test) can subscribe
//! independently; with no subscribers, events are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event the relay emits. Serialized to JSON for streaming.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayEvent {
    // ── Worker Events ─────────────────────
    /// A worker registered (or re-registered) an identity.
    WorkerRegistered { identity: String, workers: usize },
    /// A worker's connection went away.
    WorkerDisconnected { identity: String, reason: String },

    // ── Run Events ────────────────────────
    /// A multi-target run has started.
    RunStarted {
        api_name: String,
        targets: usize,
        randomized: bool,
    },
    /// Pagination of one target has started.
    TargetStarted {
        url: String,
        index: usize,
        total: usize,
    },
    /// One page for a target arrived.
    PageFetched {
        url: String,
        page: u32,
        items: usize,
    },
    /// A target finished, successfully or not.
    TargetComplete {
        url: String,
        username: String,
        total: usize,
        have: usize,
        nohave: usize,
        pages: u32,
        elapsed_ms: u64,
        error: Option<String>,
    },
    /// Every target of a run has been processed.
    RunComplete {
        api_name: String,
        targets: usize,
        items: usize,
        elapsed_ms: u64,
    },
}

/// Broadcast bus for [`RelayEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<RelayEvent>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: RelayEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Check if an event concerns a specific target URL.
pub fn event_matches_url(event: &RelayEvent, url: &str) -> bool {
    match event {
        RelayEvent::TargetStarted { url: u, .. }
        | RelayEvent::PageFetched { url: u, .. }
        | RelayEvent::TargetComplete { url: u, .. } => u == url,
        // Run and worker events are not target-specific.
        RelayEvent::WorkerRegistered { .. }
        | RelayEvent::WorkerDisconnected { .. }
        | RelayEvent::RunStarted { .. }
        | RelayEvent::RunComplete { .. } => true,
    }
}
