//! In-memory collaboration sessions.
//!
//! One `ScanSession` per scan id, created lazily when the first client
//! joins and discarded when the last presence entry leaves. All state here
//! is ephemeral by design: a server restart legitimately drops every live
//! session, lock, and change log.

pub mod heartbeat;
pub mod locks;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::Identity;
use crate::ws::{ClientHandle, ConnectionSender};
use self::locks::DeviceLock;

/// Presence metadata tracked per (session, user).
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub username: String,
    pub email: String,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// An accepted device mutation, recorded with the session version it
/// produced. Append-only; discarded with the session.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub changes: Value,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

/// State for a single scan's collaboration session.
#[derive(Debug)]
pub struct ScanSession {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every accepted device/scan mutation, never decremented.
    pub version: u64,
    clients: Vec<ClientHandle>,
    presence: HashMap<String, PresenceEntry>,
    locks: HashMap<String, DeviceLock>,
    changes: Vec<ChangeRecord>,
}

impl ScanSession {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            version: 1,
            clients: Vec::new(),
            presence: HashMap::new(),
            locks: HashMap::new(),
            changes: Vec::new(),
        }
    }
}

/// Wire shape of one presence entry in a `session_data` snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Wire shape of one held lock in a `session_data` snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLock {
    pub device_id: String,
    pub user_id: String,
    pub username: String,
    pub locked_at: DateTime<Utc>,
}

/// Full session snapshot sent to a newly joined client.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub users: Vec<SessionUser>,
    pub locks: Vec<SessionLock>,
    pub version: u64,
}

/// Result of registering a connection.
pub struct JoinOutcome {
    /// Snapshot for the joiner's `session_data` message.
    pub snapshot: SessionSnapshot,
    /// Writer handles of every other connection, for the `user_joined` broadcast.
    pub peers: Vec<ConnectionSender>,
}

/// Result of removing a connection. Carries everything the caller needs
/// to emit the teardown broadcasts without touching session state again.
pub struct LeaveOutcome {
    pub identity: Identity,
    /// Writer handle of the removed connection (used by the heartbeat
    /// reaper to push a close frame).
    pub tx: ConnectionSender,
    /// Devices whose locks were released by this departure, one
    /// `device_unlocked` broadcast each.
    pub released_devices: Vec<String>,
    /// Writer handles of the surviving connections.
    pub peers: Vec<ConnectionSender>,
    /// True if this was the last presence entry and the session was discarded.
    pub session_removed: bool,
}

/// Outcome of a `device_update` request.
pub enum DeviceUpdateOutcome {
    Applied { change_id: String, version: u64 },
    NotLocked,
}

/// In-memory session registry.
///
/// One explicit manager instance owns every session map — constructed once
/// per server and handed to handlers through `AppState`, so multiple
/// instances can coexist in tests. A DashMap keyed by scan id keeps
/// unrelated sessions independent; every mutation happens under a single
/// entry borrow, which serializes concurrent operations against the same
/// session.
#[derive(Debug, Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, ScanSession>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register a connection, lazily creating the session.
    ///
    /// Returns the snapshot for the joiner plus the peer handles for the
    /// `user_joined` broadcast.
    pub fn join(&self, scan_id: &str, client: ClientHandle) -> JoinOutcome {
        let mut entry = self
            .sessions
            .entry(scan_id.to_string())
            .or_insert_with(ScanSession::new);
        let session = entry.value_mut();

        let now = Utc::now();
        session.presence.insert(
            client.identity.user_id.clone(),
            PresenceEntry {
                username: client.identity.username.clone(),
                email: client.identity.email.clone(),
                joined_at: now,
                last_activity: now,
            },
        );

        let peers = session.clients.iter().map(|c| c.tx.clone()).collect();
        session.clients.push(client);
        session.updated_at = now;

        JoinOutcome {
            snapshot: snapshot_of(session),
            peers,
        }
    }

    /// Remove a connection. Idempotent: returns None if the connection is
    /// already gone. Releases every lock held by the departing user and
    /// discards the session when its presence table empties.
    pub fn leave(&self, scan_id: &str, conn_id: Uuid) -> Option<LeaveOutcome> {
        let outcome = {
            let mut entry = self.sessions.get_mut(scan_id)?;
            let session = entry.value_mut();

            let idx = session.clients.iter().position(|c| c.conn_id == conn_id)?;
            let client = session.clients.remove(idx);

            session.presence.remove(&client.identity.user_id);

            let released_devices: Vec<String> = session
                .locks
                .iter()
                .filter(|(_, lock)| lock.user_id == client.identity.user_id)
                .map(|(device_id, _)| device_id.clone())
                .collect();
            for device_id in &released_devices {
                session.locks.remove(device_id);
            }

            session.updated_at = Utc::now();

            LeaveOutcome {
                identity: client.identity,
                tx: client.tx,
                released_devices,
                peers: session.clients.iter().map(|c| c.tx.clone()).collect(),
                session_removed: session.presence.is_empty(),
            }
        };

        if outcome.session_removed {
            // remove_if re-checks under the shard lock so a concurrent
            // join between the borrow above and this call wins.
            let _ = self
                .sessions
                .remove_if(scan_id, |_, session| session.presence.is_empty());
        }

        Some(outcome)
    }

    /// Bump a user's presence activity timestamp. Called on every inbound
    /// message from that user.
    pub fn touch(&self, scan_id: &str, user_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(scan_id) {
            if let Some(presence) = entry.value_mut().presence.get_mut(user_id) {
                presence.last_activity = Utc::now();
            }
        }
    }

    /// Writer handles of every connection in a session, minus an optional
    /// excluded connection.
    pub fn recipients(&self, scan_id: &str, exclude: Option<Uuid>) -> Vec<ConnectionSender> {
        self.sessions
            .get(scan_id)
            .map(|entry| {
                entry
                    .value()
                    .clients
                    .iter()
                    .filter(|c| Some(c.conn_id) != exclude)
                    .map(|c| c.tx.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a device mutation: requires the sender to hold the device
    /// lock. On acceptance, bumps the session version and appends a change
    /// record carrying the new version.
    pub fn apply_device_update(
        &self,
        scan_id: &str,
        device_id: &str,
        identity: &Identity,
        changes: Value,
    ) -> Option<DeviceUpdateOutcome> {
        let mut entry = self.sessions.get_mut(scan_id)?;
        let session = entry.value_mut();

        let holds_lock = session
            .locks
            .get(device_id)
            .map(|lock| lock.user_id == identity.user_id)
            .unwrap_or(false);
        if !holds_lock {
            return Some(DeviceUpdateOutcome::NotLocked);
        }

        session.version += 1;
        let record = ChangeRecord {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            user_id: identity.user_id.clone(),
            changes,
            timestamp: Utc::now(),
            version: session.version,
        };
        let change_id = record.id.clone();
        let version = record.version;
        session.changes.push(record);
        session.updated_at = Utc::now();

        Some(DeviceUpdateOutcome::Applied { change_id, version })
    }

    /// Apply a scan-level mutation: bumps the session version
    /// unconditionally. Returns the new version.
    pub fn apply_scan_update(&self, scan_id: &str) -> Option<u64> {
        let mut entry = self.sessions.get_mut(scan_id)?;
        let session = entry.value_mut();
        session.version += 1;
        session.updated_at = Utc::now();
        Some(session.version)
    }

    /// Connections whose liveness flag is still unset since the previous
    /// sweep. Collected first so teardown never runs under iteration.
    pub fn dead_connections(&self) -> Vec<(String, Uuid)> {
        let mut dead = Vec::new();
        for entry in self.sessions.iter() {
            for client in &entry.value().clients {
                if !client.alive.load(Ordering::Relaxed) {
                    dead.push((entry.key().clone(), client.conn_id));
                }
            }
        }
        dead
    }

    /// Flag every connection not-alive and send it a liveness probe.
    /// Returns the number of probed connections.
    pub fn probe_connections(&self) -> usize {
        let mut probed = 0;
        for entry in self.sessions.iter() {
            for client in &entry.value().clients {
                client.alive.store(false, Ordering::Relaxed);
                let _ = client
                    .tx
                    .send(axum::extract::ws::Message::Ping(vec![1, 2, 3, 4].into()));
                probed += 1;
            }
        }
        probed
    }

    // --- Inspection helpers (tests and diagnostics) ---

    pub fn contains(&self, scan_id: &str) -> bool {
        self.sessions.contains_key(scan_id)
    }

    pub fn snapshot(&self, scan_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .get(scan_id)
            .map(|entry| snapshot_of(entry.value()))
    }

    pub fn client_count(&self, scan_id: &str) -> usize {
        self.sessions
            .get(scan_id)
            .map(|entry| entry.value().clients.len())
            .unwrap_or(0)
    }

    pub fn change_count(&self, scan_id: &str) -> usize {
        self.sessions
            .get(scan_id)
            .map(|entry| entry.value().changes.len())
            .unwrap_or(0)
    }
}

fn snapshot_of(session: &ScanSession) -> SessionSnapshot {
    let users = session
        .presence
        .iter()
        .map(|(user_id, presence)| SessionUser {
            user_id: user_id.clone(),
            username: presence.username.clone(),
            email: presence.email.clone(),
            joined_at: presence.joined_at,
            last_activity: presence.last_activity,
        })
        .collect();
    let locks = session
        .locks
        .iter()
        .map(|(device_id, lock)| SessionLock {
            device_id: device_id.clone(),
            user_id: lock.user_id.clone(),
            username: lock.username.clone(),
            locked_at: lock.locked_at,
        })
        .collect();
    SessionSnapshot {
        users,
        locks,
        version: session.version,
    }
}
