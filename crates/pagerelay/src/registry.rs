//! Connection registry and liveness monitor.
//!
//! Tracks the one live duplex connection per worker identity together with
//! the last time that worker was heard from. Each identity's connection and
//! liveness stamp live in the same `DashMap` entry, so every mutation of an
//! identity happens under that entry's shard lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::CallError;
use crate::protocol::ServerMessage;

/// One physical duplex connection to a worker.
///
/// Outbound frames are queued on an unbounded channel drained by the
/// transport's writer task; `close` asks the transport to tear the socket down.
pub struct WorkerConnection {
    id: Uuid,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    closed: Notify,
    is_closed: AtomicBool,
}

impl fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkerConnection {
    pub fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            closed: Notify::new(),
            is_closed: AtomicBool::new(false),
        }
    }

    /// Create a connection together with the receiving end of its outbound queue.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame for the worker.
    pub fn send(&self, msg: ServerMessage) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::WorkerUnavailable(format!(
                "connection {} is closed",
                self.id
            )));
        }
        self.outbound.send(msg).map_err(|_| {
            CallError::WorkerUnavailable(format!("connection {} writer has stopped", self.id))
        })
    }

    /// Ask the transport to close this connection. Idempotent.
    pub fn close(&self) {
        if !self.is_closed.swap(true, Ordering::SeqCst) {
            self.closed.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

struct WorkerEntry {
    connection: Arc<WorkerConnection>,
    last_seen: Instant,
}

/// Live connections keyed by worker identity.
pub struct ConnectionRegistry {
    workers: DashMap<String, WorkerEntry>,
    heartbeat_interval: Duration,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("workers", &self.workers.len())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            heartbeat_interval,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Install `connection` for `identity` and reset its liveness stamp.
    ///
    /// Returns the connection it superseded, which is left open.
    pub fn register(
        &self,
        identity: &str,
        connection: Arc<WorkerConnection>,
    ) -> Option<Arc<WorkerConnection>> {
        let previous = self.workers.insert(
            identity.to_string(),
            WorkerEntry {
                connection,
                last_seen: Instant::now(),
            },
        );
        previous.map(|entry| entry.connection)
    }

    /// Record a liveness signal. Unknown identities are ignored.
    pub fn touch(&self, identity: &str) {
        if let Some(mut entry) = self.workers.get_mut(identity) {
            entry.last_seen = Instant::now();
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<Arc<WorkerConnection>> {
        self.workers
            .get(identity)
            .map(|entry| Arc::clone(&entry.connection))
    }

    pub fn last_seen(&self, identity: &str) -> Option<Instant> {
        self.workers.get(identity).map(|entry| entry.last_seen)
    }

    /// Remove whatever connection is registered for `identity`.
    pub fn unregister(&self, identity: &str) -> Option<Arc<WorkerConnection>> {
        self.workers
            .remove(identity)
            .map(|(_, entry)| entry.connection)
    }

    /// Remove `identity` only if it is still bound to `connection_id`.
    ///
    /// Used on socket close so a superseded connection going away does not
    /// evict the connection that replaced it.
    pub fn unregister_connection(&self, identity: &str, connection_id: Uuid) -> bool {
        self.workers
            .remove_if(identity, |_, entry| entry.connection.id() == connection_id)
            .is_some()
    }

    /// Close and unregister every worker silent for more than twice the
    /// heartbeat interval as of `now`. Returns the evicted identities.
    pub fn sweep_at(&self, now: Instant) -> Vec<String> {
        let threshold = self.heartbeat_interval * 2;
        let is_stale = |entry: &WorkerEntry| now.saturating_duration_since(entry.last_seen) > threshold;

        let candidates: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for identity in candidates {
            // Re-checked under the entry lock: a heartbeat may have landed since the scan.
            if let Some((_, entry)) = self.workers.remove_if(&identity, |_, e| is_stale(e)) {
                entry.connection.close();
                tracing::info!("Worker {identity} disconnected due to heartbeat timeout");
                evicted.push(identity);
            }
        }
        evicted
    }

    /// Run `sweep_at` every heartbeat interval until `shutdown` is notified.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let period = registry.heartbeat_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_at(Instant::now());
                        if !evicted.is_empty() {
                            tracing::debug!("Liveness sweep evicted {} worker(s)", evicted.len());
                        }
                    }
                    _ = shutdown.notified() => {
                        tracing::debug!("Liveness sweeper stopped");
                        break;
                    }
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Registered identities, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
