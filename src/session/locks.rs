//! Per-device edit locks.
//!
//! A lock is an exclusive claim on one device within one session. The
//! check-then-set in `acquire_lock` runs under a single session borrow,
//! which is what guarantees at most one holder per device: two concurrent
//! requests for the same device serialize on the session entry.

use chrono::{DateTime, Utc};

use super::SessionManager;
use crate::auth::Identity;

/// A held lock. Exists only while held; released explicitly or when the
/// holder disconnects.
#[derive(Debug, Clone)]
pub struct DeviceLock {
    pub user_id: String,
    pub username: String,
    pub locked_at: DateTime<Utc>,
}

/// Outcome of a lock acquisition attempt.
pub enum LockOutcome {
    Acquired,
    /// Someone else holds it; carries the holder's username for the
    /// rejection reply. State is untouched.
    Conflict { locked_by: String },
}

impl SessionManager {
    /// Acquire (or refresh) the lock on a device. Re-acquiring a lock you
    /// already hold succeeds and refreshes the acquisition time. Returns
    /// None if the session no longer exists.
    pub fn acquire_lock(
        &self,
        scan_id: &str,
        device_id: &str,
        identity: &Identity,
    ) -> Option<LockOutcome> {
        let mut entry = self.sessions.get_mut(scan_id)?;
        let session = entry.value_mut();

        if let Some(lock) = session.locks.get(device_id) {
            if lock.user_id != identity.user_id {
                return Some(LockOutcome::Conflict {
                    locked_by: lock.username.clone(),
                });
            }
        }

        session.locks.insert(
            device_id.to_string(),
            DeviceLock {
                user_id: identity.user_id.clone(),
                username: identity.username.clone(),
                locked_at: Utc::now(),
            },
        );
        session.updated_at = Utc::now();

        Some(LockOutcome::Acquired)
    }

    /// Release a lock if (and only if) the caller holds it. Releasing a
    /// lock you do not hold is a silent no-op, never an error.
    pub fn release_lock(&self, scan_id: &str, device_id: &str, user_id: &str) -> bool {
        let Some(mut entry) = self.sessions.get_mut(scan_id) else {
            return false;
        };
        let session = entry.value_mut();

        let held_by_caller = session
            .locks
            .get(device_id)
            .map(|lock| lock.user_id == user_id)
            .unwrap_or(false);
        if !held_by_caller {
            return false;
        }

        session.locks.remove(device_id);
        session.updated_at = Utc::now();
        true
    }
}
