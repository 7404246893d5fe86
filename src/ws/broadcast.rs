//! Fan-out delivery to session members.
//!
//! Messages are serialized once per broadcast. Delivery is best-effort per
//! connection: a send failure means the receiver's actor already exited,
//! and must never prevent delivery to the rest or surface to the caller.

use axum::extract::ws::Message;
use chrono::Utc;

use super::protocol::{Outbound, ServerMessage};
use super::ConnectionSender;

/// Send a message to every listed connection.
pub fn broadcast(recipients: &[ConnectionSender], message: &ServerMessage) {
    let Some(frame) = encode(message) else {
        return;
    };
    for tx in recipients {
        if tx.send(frame.clone()).is_err() {
            tracing::debug!("Dropped broadcast to closed connection");
        }
    }
}

/// Send a message to a single connection.
pub fn send_to(tx: &ConnectionSender, message: &ServerMessage) {
    if let Some(frame) = encode(message) {
        let _ = tx.send(frame);
    }
}

fn encode(message: &ServerMessage) -> Option<Message> {
    let envelope = Outbound {
        message,
        timestamp: Utc::now(),
    };
    match serde_json::to_string(&envelope) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize outbound message");
            None
        }
    }
}
