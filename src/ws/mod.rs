pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Identity;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// One live client connection, registered with exactly one scan session
/// for its entire lifetime.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    /// Server-generated connection id, distinct from the user id so the
    /// same user can hold connections into different scans.
    pub conn_id: Uuid,
    /// Scan session this connection is bound to.
    pub scan_id: String,
    /// Verified identity from the auth gate.
    pub identity: Identity,
    /// Writer handle; cloned wherever a message must reach this client.
    pub tx: ConnectionSender,
    /// Liveness flag: set false by each heartbeat sweep, set true again
    /// when the client's pong arrives. Still false at the next sweep means
    /// the connection is reaped.
    pub alive: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn new(scan_id: String, identity: Identity, tx: ConnectionSender) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            scan_id,
            identity,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }
}
