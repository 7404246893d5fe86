//! Wire protocol and message dispatch.
//!
//! Frames are JSON envelopes `{ "type": ..., "data": ... }`. Inbound frames
//! decode into the closed `ClientMessage` enum, so adding a message type is
//! a compile-time decision; an unknown `type` falls into the catch-all
//! variant and is ignored, while a malformed frame gets an `error` reply.
//! Server-to-client envelopes additionally carry a timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{DeviceUpdateOutcome, SessionLock, SessionUser};
use crate::session::locks::LockOutcome;
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::ClientHandle;

/// Client → server messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    DeviceLock { device_id: String },
    #[serde(rename_all = "camelCase")]
    DeviceUnlock { device_id: String },
    #[serde(rename_all = "camelCase")]
    DeviceUpdate {
        device_id: String,
        changes: Value,
        /// Version the client last saw. Informational: pessimistic locking
        /// already serializes writers, so it is not used for conflict checks.
        #[serde(default)]
        version: Option<u64>,
    },
    ScanUpdate { changes: Value },
    #[serde(rename_all = "camelCase")]
    CursorPosition { device_id: String, position: Value },
    #[serde(rename_all = "camelCase")]
    TypingIndicator {
        device_id: String,
        field: String,
        is_typing: bool,
    },
    Ping {},
    /// Unrecognized type tag: logged and ignored, never an error.
    #[serde(other)]
    Unknown,
}

/// Server → client messages. Wrapped in [`Outbound`] before serialization.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: String,
        username: String,
        email: String,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String, username: String },
    SessionData {
        users: Vec<SessionUser>,
        locks: Vec<SessionLock>,
        version: u64,
    },
    #[serde(rename_all = "camelCase")]
    DeviceLocked {
        device_id: String,
        user_id: String,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    DeviceLockFailed {
        device_id: String,
        reason: String,
        locked_by: String,
    },
    #[serde(rename_all = "camelCase")]
    DeviceUnlocked { device_id: String, user_id: String },
    #[serde(rename_all = "camelCase")]
    DeviceUpdated {
        device_id: String,
        changes: Value,
        change_id: String,
        user_id: String,
        username: String,
        version: u64,
    },
    #[serde(rename_all = "camelCase")]
    DeviceUpdateFailed { device_id: String, reason: String },
    #[serde(rename_all = "camelCase")]
    ScanUpdated {
        changes: Value,
        user_id: String,
        username: String,
        version: u64,
    },
    #[serde(rename_all = "camelCase")]
    CursorPosition {
        device_id: String,
        user_id: String,
        username: String,
        position: Value,
    },
    #[serde(rename_all = "camelCase")]
    TypingIndicator {
        device_id: String,
        field: String,
        is_typing: bool,
        user_id: String,
        username: String,
    },
    Pong {},
    Error { message: String },
}

/// Outbound envelope: the tagged message plus a server timestamp.
#[derive(Serialize)]
pub struct Outbound<'a> {
    #[serde(flatten)]
    pub message: &'a ServerMessage,
    pub timestamp: DateTime<Utc>,
}

/// Handle one inbound text frame.
///
/// Decode failure replies `error` to the sender and leaves the connection
/// open — protocol errors are never fatal to the transport. Decode success
/// refreshes the sender's presence activity, then dispatches.
pub fn handle_text(state: &AppState, client: &ClientHandle, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                user_id = %client.identity.user_id,
                error = %e,
                "Failed to decode inbound frame"
            );
            broadcast::send_to(
                &client.tx,
                &ServerMessage::Error {
                    message: "Invalid message format".to_string(),
                },
            );
            return;
        }
    };

    state
        .sessions
        .touch(&client.scan_id, &client.identity.user_id);

    match message {
        ClientMessage::DeviceLock { device_id } => handle_device_lock(state, client, device_id),
        ClientMessage::DeviceUnlock { device_id } => handle_device_unlock(state, client, device_id),
        ClientMessage::DeviceUpdate {
            device_id,
            changes,
            version: _,
        } => handle_device_update(state, client, device_id, changes),
        ClientMessage::ScanUpdate { changes } => handle_scan_update(state, client, changes),
        ClientMessage::CursorPosition {
            device_id,
            position,
        } => {
            // Pure relay, no state mutation.
            relay_excluding_sender(
                state,
                client,
                ServerMessage::CursorPosition {
                    device_id,
                    user_id: client.identity.user_id.clone(),
                    username: client.identity.username.clone(),
                    position,
                },
            );
        }
        ClientMessage::TypingIndicator {
            device_id,
            field,
            is_typing,
        } => {
            relay_excluding_sender(
                state,
                client,
                ServerMessage::TypingIndicator {
                    device_id,
                    field,
                    is_typing,
                    user_id: client.identity.user_id.clone(),
                    username: client.identity.username.clone(),
                },
            );
        }
        ClientMessage::Ping {} => {
            broadcast::send_to(&client.tx, &ServerMessage::Pong {});
        }
        ClientMessage::Unknown => {
            tracing::debug!(
                user_id = %client.identity.user_id,
                "Ignoring unrecognized message type"
            );
        }
    }
}

fn handle_device_lock(state: &AppState, client: &ClientHandle, device_id: String) {
    match state
        .sessions
        .acquire_lock(&client.scan_id, &device_id, &client.identity)
    {
        Some(LockOutcome::Acquired) => {
            let recipients = state.sessions.recipients(&client.scan_id, None);
            broadcast::broadcast(
                &recipients,
                &ServerMessage::DeviceLocked {
                    device_id,
                    user_id: client.identity.user_id.clone(),
                    username: client.identity.username.clone(),
                },
            );
        }
        Some(LockOutcome::Conflict { locked_by }) => {
            // Contention is not an error; only the requester hears about it.
            broadcast::send_to(
                &client.tx,
                &ServerMessage::DeviceLockFailed {
                    device_id,
                    reason: "Device is locked by another user".to_string(),
                    locked_by,
                },
            );
        }
        None => {}
    }
}

fn handle_device_unlock(state: &AppState, client: &ClientHandle, device_id: String) {
    if state
        .sessions
        .release_lock(&client.scan_id, &device_id, &client.identity.user_id)
    {
        let recipients = state.sessions.recipients(&client.scan_id, None);
        broadcast::broadcast(
            &recipients,
            &ServerMessage::DeviceUnlocked {
                device_id,
                user_id: client.identity.user_id.clone(),
            },
        );
    }
}

fn handle_device_update(
    state: &AppState,
    client: &ClientHandle,
    device_id: String,
    changes: Value,
) {
    match state.sessions.apply_device_update(
        &client.scan_id,
        &device_id,
        &client.identity,
        changes.clone(),
    ) {
        Some(DeviceUpdateOutcome::Applied { change_id, version }) => {
            relay_excluding_sender(
                state,
                client,
                ServerMessage::DeviceUpdated {
                    device_id,
                    changes,
                    change_id,
                    user_id: client.identity.user_id.clone(),
                    username: client.identity.username.clone(),
                    version,
                },
            );
        }
        Some(DeviceUpdateOutcome::NotLocked) => {
            broadcast::send_to(
                &client.tx,
                &ServerMessage::DeviceUpdateFailed {
                    device_id,
                    reason: "Device not locked by user".to_string(),
                },
            );
        }
        None => {}
    }
}

fn handle_scan_update(state: &AppState, client: &ClientHandle, changes: Value) {
    if let Some(version) = state.sessions.apply_scan_update(&client.scan_id) {
        relay_excluding_sender(
            state,
            client,
            ServerMessage::ScanUpdated {
                changes,
                user_id: client.identity.user_id.clone(),
                username: client.identity.username.clone(),
                version,
            },
        );
    }
}

fn relay_excluding_sender(state: &AppState, client: &ClientHandle, message: ServerMessage) {
    let recipients = state.sessions.recipients(&client.scan_id, Some(client.conn_id));
    broadcast::broadcast(&recipients, &message);
}
