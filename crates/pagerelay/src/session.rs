//! Per-connection worker session.
//!
//! Interprets inbound worker frames against the registry and broker,
//! independent of the socket type carrying them. The transport feeds every
//! text frame to [`WorkerSession::handle_text`] and calls
//! [`WorkerSession::finish`] once the socket is gone.

use std::sync::Arc;

use crate::broker::Broker;
use crate::events::{EventBus, RelayEvent};
use crate::protocol::{parse_worker_message, ServerMessage, WorkerMessage};
use crate::registry::{ConnectionRegistry, WorkerConnection};

/// Error text sent when a connection exhausts its reconnect budget.
pub const MAX_RECONNECTS_MESSAGE: &str = "Maximum reconnection attempts reached";

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Continue,
    /// Flush queued frames, then close the socket.
    Close,
}

pub struct WorkerSession {
    connection: Arc<WorkerConnection>,
    registry: Arc<ConnectionRegistry>,
    broker: Arc<Broker>,
    events: Option<Arc<EventBus>>,
    identity: Option<String>,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession")
            .field("connection", &self.connection.id())
            .field("identity", &self.identity)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish()
    }
}

impl WorkerSession {
    pub fn new(
        connection: Arc<WorkerConnection>,
        broker: Arc<Broker>,
        max_reconnect_attempts: u32,
    ) -> Self {
        Self {
            registry: Arc::clone(broker.registry()),
            connection,
            broker,
            events: None,
            identity: None,
            reconnect_attempts: 0,
            max_reconnect_attempts,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn connection(&self) -> &Arc<WorkerConnection> {
        &self.connection
    }

    /// Queue the heartbeat request every worker receives on connect.
    pub fn open(&self) -> SessionAction {
        match self.connection.send(ServerMessage::HeartbeatRequest) {
            Ok(()) => SessionAction::Continue,
            Err(e) => {
                tracing::warn!("Could not greet connection {}: {e}", self.connection.id());
                SessionAction::Close
            }
        }
    }

    /// Handle one inbound text frame. Malformed frames are logged and ignored.
    pub fn handle_text(&mut self, text: &str) -> SessionAction {
        match parse_worker_message(text) {
            Ok(msg) => self.handle(msg),
            Err(e) => {
                tracing::warn!("Invalid message on connection {}: {e}", self.connection.id());
                SessionAction::Continue
            }
        }
    }

    pub fn handle(&mut self, msg: WorkerMessage) -> SessionAction {
        match msg {
            WorkerMessage::Register { id } => {
                self.register(id);
                SessionAction::Continue
            }
            WorkerMessage::Response {
                request_id,
                result,
                error,
            } => {
                self.broker.resolve_reply(&request_id, result, error);
                SessionAction::Continue
            }
            WorkerMessage::Heartbeat => {
                if let Some(identity) = &self.identity {
                    self.registry.touch(identity);
                }
                SessionAction::Continue
            }
            WorkerMessage::Reconnect => self.reconnect(),
        }
    }

    fn register(&mut self, id: String) {
        if let Some(current) = self.identity.take() {
            tracing::info!("Client {id} already registered as {current}, updating connection");
            if current != id {
                self.registry
                    .unregister_connection(&current, self.connection.id());
            }
        }

        let previous = self.registry.register(&id, Arc::clone(&self.connection));
        if previous.is_some_and(|p| p.id() != self.connection.id()) {
            tracing::info!("Client {id} superseded an older connection");
        }
        self.reconnect_attempts = 0;

        let workers = self.registry.len();
        tracing::info!("Registered client: {id} (total: {workers})");
        if let Some(events) = &self.events {
            events.emit(RelayEvent::WorkerRegistered {
                identity: id.clone(),
                workers,
            });
        }
        self.identity = Some(id);
    }

    fn reconnect(&mut self) -> SessionAction {
        if self.reconnect_attempts >= self.max_reconnect_attempts {
            tracing::warn!(
                "Connection {} exceeded {} reconnection attempts",
                self.connection.id(),
                self.max_reconnect_attempts
            );
            let _ = self.connection.send(ServerMessage::Error {
                error: MAX_RECONNECTS_MESSAGE.to_string(),
            });
            return SessionAction::Close;
        }
        self.reconnect_attempts += 1;
        tracing::info!(
            "Reconnection attempt {} for client {}",
            self.reconnect_attempts,
            self.identity.as_deref().unwrap_or("<unregistered>")
        );
        SessionAction::Continue
    }

    /// Tear down after the socket closed: unregister the identity if this
    /// connection still owns it and fail every call still waiting on it.
    ///
    /// Returns the identity that went offline, if any. An identity already
    /// evicted by the liveness sweep counts; one taken over by a newer
    /// connection does not.
    pub fn finish(self, reason: &str) -> Option<String> {
        let connection_id = self.connection.id();
        self.connection.close();
        let failed = self.broker.fail_connection(connection_id);
        if failed > 0 {
            tracing::debug!("Failed {failed} in-flight call(s) on connection {connection_id}");
        }

        let identity = self.identity?;
        let released = self.registry.unregister_connection(&identity, connection_id)
            || self.registry.lookup(&identity).is_none();
        if !released {
            return None;
        }
        tracing::info!(
            "WebSocket disconnected: {identity} (total: {})",
            self.registry.len()
        );
        if let Some(events) = &self.events {
            events.emit(RelayEvent::WorkerDisconnected {
                identity: identity.clone(),
                reason: reason.to_string(),
            });
        }
        Some(identity)
    }
}
