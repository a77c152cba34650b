//! Duplex wire protocol between the relay and its workers.
//!
//! Every frame is a JSON object tagged by its `type` field. Workers announce
//! themselves with `register`, answer `api_call`s with `response`, and keep
//! the connection alive with `heartbeat`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker announces its identity; supersedes any previous connection.
    Register { id: String },
    /// Reply to an earlier `api_call`.
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    /// Liveness signal.
    Heartbeat,
    /// Worker-initiated re-registration signal.
    Reconnect,
}

/// A frame sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Ask the worker to run one api call.
    ApiCall {
        #[serde(rename = "requestId")]
        request_id: String,
        apiname: String,
        apiparams: Value,
    },
    /// Sent once on connect so the worker starts its heartbeat.
    HeartbeatRequest,
    /// Terminal error; the connection is closed right after.
    Error { error: String },
}

/// Parse one text frame from a worker.
pub fn parse_worker_message(text: &str) -> serde_json::Result<WorkerMessage> {
    serde_json::from_str(text.trim())
}

/// Serialize a frame for a worker.
pub fn encode_server_message(msg: &ServerMessage) -> serde_json::Result<String> {
    serde_json::to_string(msg)
}

/// Render a worker-supplied error value as a message string.
///
/// Workers send either a plain string or a structured object; objects with a
/// `message` field use it, anything else is rendered as compact JSON.
pub fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => error.to_string(),
        },
        other => other.to_string(),
    }
}
