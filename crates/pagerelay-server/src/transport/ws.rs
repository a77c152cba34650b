//! WebSocket transport for workers.
//!
//! Each socket is split into a writer task draining the connection's
//! outbound queue and a reader loop feeding frames to a [`WorkerSession`].

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use pagerelay::{ServerMessage, SessionAction, WorkerConnection, WorkerSession};
use tokio::sync::mpsc::UnboundedReceiver;

use super::framing::{frame_message, frame_text};
use crate::state::AppState;

/// Handle WebSocket upgrade request.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (connection, outbound) = WorkerConnection::channel();
    let conn_id = connection.id();
    tracing::info!("WebSocket connected: {conn_id}");

    let writer = tokio::spawn(write_loop(ws_sender, outbound, Arc::clone(&connection)));

    let mut session = WorkerSession::new(
        Arc::clone(&connection),
        Arc::clone(&state.broker),
        state.config.max_reconnect_attempts,
    )
    .with_events(Arc::clone(&state.events));

    let mut reason = "closed by worker";
    if session.open() == SessionAction::Continue {
        loop {
            tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        let Some(text) = frame_text(&msg) else { continue };
                        if session.handle_text(text) == SessionAction::Close {
                            reason = "reconnect budget exhausted";
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error for client {:?}: {e}", session.identity());
                        reason = "socket error";
                        break;
                    }
                },
                _ = connection.closed() => {
                    reason = "closed by server";
                    break;
                }
            }
        }
    }

    session.finish(reason);
    if let Err(e) = writer.await {
        tracing::warn!("Writer task for {conn_id} failed: {e}");
    }
    tracing::debug!("Connection {conn_id} torn down: {reason}");
}

/// Forward queued frames to the socket until the connection is closed,
/// then flush what is left and send a close frame.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: UnboundedReceiver<ServerMessage>,
    connection: Arc<WorkerConnection>,
) {
    loop {
        tokio::select! {
            biased;
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if send(&mut sender, &msg).await.is_err() {
                    connection.close();
                    return;
                }
            }
            _ = connection.closed() => {
                while let Ok(msg) = outbound.try_recv() {
                    if send(&mut sender, &msg).await.is_err() {
                        return;
                    }
                }
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        }
    }
}

async fn send(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match frame_message(msg) {
        Ok(frame) => sender.send(frame).await,
        Err(e) => {
            tracing::error!("Failed to encode outbound frame: {e}");
            Ok(())
        }
    }
}
