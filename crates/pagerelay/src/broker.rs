//! Correlation broker: bridges awaiting callers to duplex-connected workers.
//!
//! Each outbound call gets a fresh correlation id and a pending entry holding
//! the caller's reply slot. Whatever settles the call first (a matching
//! reply, the deadline, or the owning connection closing) removes the entry
//! from the table; that removal is the only path to the reply slot, so a call
//! resolves at most once and later events for the same id are dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::CallError;
use crate::protocol::{error_message, ServerMessage};
use crate::registry::ConnectionRegistry;

type CallOutcome = Result<Value, CallError>;

/// Worker-error text for a call whose frame could not be queued.
pub const DISPATCH_FAILURE: &str = "Failed to send request to worker";

struct PendingCall {
    identity: String,
    connection_id: Uuid,
    issued_at: Instant,
    reply: oneshot::Sender<CallOutcome>,
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Routes calls to workers and replies back to callers.
pub struct Broker {
    registry: Arc<ConnectionRegistry>,
    pending: DashMap<String, PendingCall>,
    request_timeout: Duration,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("in_flight", &self.pending.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Removes the pending entry if the caller stops waiting before resolution.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingCall>,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.request_id);
    }
}

impl Broker {
    pub fn new(registry: Arc<ConnectionRegistry>, request_timeout: Duration) -> Self {
        Self {
            registry,
            pending: DashMap::new(),
            request_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Call `api_name` on the worker registered as `identity` with the
    /// configured request timeout.
    pub async fn call(&self, identity: &str, api_name: &str, params: Value) -> CallOutcome {
        self.call_with_timeout(identity, api_name, params, self.request_timeout)
            .await
    }

    /// Call `api_name` on `identity`, giving up after `timeout`.
    pub async fn call_with_timeout(
        &self,
        identity: &str,
        api_name: &str,
        params: Value,
        timeout: Duration,
    ) -> CallOutcome {
        let connection = self
            .registry
            .lookup(identity)
            .ok_or_else(|| CallError::WorkerUnavailable(identity.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        let request_id = self.insert_pending(PendingCall {
            identity: identity.to_string(),
            connection_id: connection.id(),
            issued_at: Instant::now(),
            reply: tx,
        });
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: &request_id,
        };

        tracing::debug!("Dispatching {api_name} to {identity} as {request_id}");

        let frame = ServerMessage::ApiCall {
            request_id: request_id.clone(),
            apiname: api_name.to_string(),
            apiparams: params,
        };
        if let Err(e) = connection.send(frame) {
            tracing::warn!("Failed to send {request_id} to {identity}: {e}");
            self.settle(
                &request_id,
                Err(CallError::WorkerReportedError(DISPATCH_FAILURE.to_string())),
            );
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(delivered) => delivered.unwrap_or_else(|_| Err(self.vanished(identity))),
            Err(_) => {
                if self.pending.remove(&request_id).is_some() {
                    tracing::warn!("Request {request_id} to {identity} timed out");
                    Err(CallError::Timeout(timeout.as_millis() as u64))
                } else {
                    // Settled concurrently with the deadline; the outcome is already in the slot.
                    rx.await.unwrap_or_else(|_| Err(self.vanished(identity)))
                }
            }
        }
    }

    /// Settle the pending call for `request_id` from a worker `response`.
    ///
    /// A truthy `error` rejects the call; `null`, `false`, `0` and `""` do
    /// not, and the call succeeds with `result` (null if absent). Returns
    /// `false` when no call is waiting under that id, e.g. it already timed out.
    pub fn resolve_reply(
        &self,
        request_id: &str,
        result: Option<Value>,
        error: Option<Value>,
    ) -> bool {
        let outcome = match error {
            Some(err) if is_truthy(&err) => Err(CallError::WorkerReportedError(error_message(&err))),
            _ => Ok(result.unwrap_or(Value::Null)),
        };
        let settled = self.settle(request_id, outcome);
        if !settled {
            tracing::debug!("Dropping reply for unknown or settled request {request_id}");
        }
        settled
    }

    /// Reject every call dispatched on a connection that has gone away.
    /// Returns how many calls were settled.
    pub fn fail_connection(&self, connection_id: Uuid) -> usize {
        let orphaned: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for request_id in orphaned {
            let removed = self
                .pending
                .remove_if(&request_id, |_, call| call.connection_id == connection_id);
            if let Some((_, call)) = removed {
                tracing::debug!(
                    "Failing {request_id} after {:?}: connection to {} closed",
                    call.issued_at.elapsed(),
                    call.identity
                );
                let _ = call.reply.send(Err(CallError::WorkerUnavailable(call.identity)));
                failed += 1;
            }
        }
        failed
    }

    /// Number of calls currently awaiting resolution.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn settle(&self, request_id: &str, outcome: CallOutcome) -> bool {
        match self.pending.remove(request_id) {
            Some((_, call)) => {
                tracing::debug!(
                    "Request {request_id} for {} settled after {:?}",
                    call.identity,
                    call.issued_at.elapsed()
                );
                // The caller may have stopped waiting; nothing else to do then.
                let _ = call.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    fn insert_pending(&self, call: PendingCall) -> String {
        loop {
            let request_id = Uuid::new_v4().simple().to_string();
            match self.pending.entry(request_id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(call);
                    return request_id;
                }
            }
        }
    }

    fn vanished(&self, identity: &str) -> CallError {
        CallError::WorkerUnavailable(identity.to_string())
    }
}
