//! WebSocket frame conversion for the worker protocol.

use axum::extract::ws::Message;
use pagerelay::protocol::encode_server_message;
use pagerelay::ServerMessage;

/// Text payload of an inbound frame. Binary frames are accepted when they
/// hold UTF-8; control frames carry no payload.
pub fn frame_text(msg: &Message) -> Option<&str> {
    match msg {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}

/// Encode an outbound message as a text frame.
pub fn frame_message(msg: &ServerMessage) -> serde_json::Result<Message> {
    encode_server_message(msg).map(Message::Text)
}
