use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Identity;
use crate::session::LeaveOutcome;
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::protocol::{self, ServerMessage};
use crate::ws::ClientHandle;

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: processes incoming frames, dispatches to protocol handlers
///
/// The mpsc channel allows any part of the system to send messages to this
/// client by cloning the sender.
pub async fn run_connection(
    socket: WebSocket,
    state: AppState,
    scan_id: String,
    identity: Identity,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let client = ClientHandle::new(scan_id.clone(), identity, tx.clone());

    // Register with the session (created lazily on first join).
    let joined = state.sessions.join(&scan_id, client.clone());

    // Everyone already in the session learns about the newcomer...
    broadcast::broadcast(
        &joined.peers,
        &ServerMessage::UserJoined {
            user_id: client.identity.user_id.clone(),
            username: client.identity.username.clone(),
            email: client.identity.email.clone(),
        },
    );

    // ...and the newcomer gets the full session snapshot.
    broadcast::send_to(
        &tx,
        &ServerMessage::SessionData {
            users: joined.snapshot.users,
            locks: joined.snapshot.locks,
            version: joined.snapshot.version,
        },
    );

    tracing::info!(
        user_id = %client.identity.user_id,
        scan_id = %scan_id,
        "WebSocket actor started"
    );

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Reader loop: process incoming WebSocket messages
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text(&state, &client, text.as_str());
                }
                Message::Binary(_) => {
                    tracing::debug!(
                        user_id = %client.identity.user_id,
                        "Received binary frame (expected JSON text), ignoring"
                    );
                }
                Message::Pong(_) => {
                    // Probe acknowledged — connection stays alive for
                    // another heartbeat period.
                    client.alive.store(true, Ordering::Relaxed);
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %client.identity.user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %client.identity.user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(
                    user_id = %client.identity.user_id,
                    "WebSocket stream ended"
                );
                break;
            }
        }
    }

    // Cleanup: abort writer task, then run the shared teardown path.
    writer_handle.abort();
    let _ = disconnect(&state, &scan_id, client.conn_id);

    tracing::info!(
        user_id = %client.identity.user_id,
        scan_id = %scan_id,
        "WebSocket actor stopped"
    );
}

/// Shared teardown: deregister the connection and emit the departure
/// broadcasts. Used by the reader loop on transport close and by the
/// heartbeat monitor when reaping a dead connection, and idempotent so
/// the two paths can race.
pub fn disconnect(state: &AppState, scan_id: &str, conn_id: Uuid) -> Option<LeaveOutcome> {
    let outcome = state.sessions.leave(scan_id, conn_id)?;

    // Every lock the departing user held is released, one broadcast each.
    for device_id in &outcome.released_devices {
        broadcast::broadcast(
            &outcome.peers,
            &ServerMessage::DeviceUnlocked {
                device_id: device_id.clone(),
                user_id: outcome.identity.user_id.clone(),
            },
        );
    }

    if !outcome.session_removed {
        broadcast::broadcast(
            &outcome.peers,
            &ServerMessage::UserLeft {
                user_id: outcome.identity.user_id.clone(),
                username: outcome.identity.username.clone(),
            },
        );
    } else {
        tracing::debug!(scan_id = %scan_id, "Last participant left, session discarded");
    }

    Some(outcome)
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
