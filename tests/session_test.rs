//! Direct tests for the session registry, lock coordinator, and heartbeat
//! sweep: presence/lock/version invariants without a network in the loop.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use scanhub_server::auth::Identity;
use scanhub_server::session::locks::LockOutcome;
use scanhub_server::session::{heartbeat, DeviceUpdateOutcome, SessionManager};
use scanhub_server::state::AppState;
use scanhub_server::ws::ClientHandle;

fn identity(user_id: &str) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        username: user_id.to_string(),
        email: format!("{}@example.com", user_id),
    }
}

/// Build a client handle plus the receiving end of its writer channel.
fn client(scan_id: &str, user_id: &str) -> (ClientHandle, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ClientHandle::new(scan_id.to_string(), identity(user_id), tx),
        rx,
    )
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}

#[test]
fn test_presence_matches_clients_at_rest() {
    let sessions = SessionManager::new();
    let (c1, _rx1) = client("s1", "user1");
    let (c2, _rx2) = client("s1", "user2");
    let conn1 = c1.conn_id;
    let conn2 = c2.conn_id;

    sessions.join("s1", c1);
    sessions.join("s1", c2);

    let snapshot = sessions.snapshot("s1").expect("session exists");
    assert_eq!(snapshot.users.len(), 2);
    assert_eq!(sessions.client_count("s1"), 2);

    sessions.leave("s1", conn1).expect("first leave succeeds");
    let snapshot = sessions.snapshot("s1").expect("session still exists");
    assert_eq!(snapshot.users.len(), 1);
    assert_eq!(sessions.client_count("s1"), 1);

    let outcome = sessions.leave("s1", conn2).expect("second leave succeeds");
    assert!(outcome.session_removed);
    assert!(!sessions.contains("s1"));
}

#[test]
fn test_fresh_session_snapshot() {
    let sessions = SessionManager::new();
    let (c1, _rx1) = client("s1", "user1");

    let joined = sessions.join("s1", c1);
    assert_eq!(joined.snapshot.users.len(), 1);
    assert_eq!(joined.snapshot.users[0].user_id, "user1");
    assert!(joined.snapshot.locks.is_empty());
    assert_eq!(joined.snapshot.version, 1);
    assert!(joined.peers.is_empty(), "first joiner has no peers");
}

#[test]
fn test_lock_mutual_exclusion() {
    let sessions = SessionManager::new();
    let (c1, _rx1) = client("s1", "user1");
    let (c2, _rx2) = client("s1", "user2");
    sessions.join("s1", c1);
    sessions.join("s1", c2);

    match sessions.acquire_lock("s1", "d1", &identity("user1")) {
        Some(LockOutcome::Acquired) => {}
        _ => panic!("first acquire should succeed"),
    }

    match sessions.acquire_lock("s1", "d1", &identity("user2")) {
        Some(LockOutcome::Conflict { locked_by }) => assert_eq!(locked_by, "user1"),
        _ => panic!("second user should conflict"),
    }

    // Same-holder re-acquire refreshes, never conflicts
    match sessions.acquire_lock("s1", "d1", &identity("user1")) {
        Some(LockOutcome::Acquired) => {}
        _ => panic!("re-acquire by holder should succeed"),
    }

    let snapshot = sessions.snapshot("s1").unwrap();
    assert_eq!(snapshot.locks.len(), 1, "at most one lock per device");
    assert_eq!(snapshot.locks[0].user_id, "user1");
}

#[test]
fn test_release_unheld_lock_is_noop() {
    let sessions = SessionManager::new();
    let (c1, _rx1) = client("s1", "user1");
    sessions.join("s1", c1);

    assert!(matches!(
        sessions.acquire_lock("s1", "d1", &identity("user1")),
        Some(LockOutcome::Acquired)
    ));

    // user2 does not hold the lock
    assert!(!sessions.release_lock("s1", "d1", "user2"));
    assert_eq!(sessions.snapshot("s1").unwrap().locks.len(), 1);

    // Releasing a device with no lock at all is also a no-op
    assert!(!sessions.release_lock("s1", "d9", "user1"));

    // The holder can release
    assert!(sessions.release_lock("s1", "d1", "user1"));
    assert!(sessions.snapshot("s1").unwrap().locks.is_empty());
}

#[test]
fn test_leave_releases_all_held_locks() {
    let sessions = SessionManager::new();
    let (c1, _rx1) = client("s1", "user1");
    let (c2, _rx2) = client("s1", "user2");
    let conn1 = c1.conn_id;
    sessions.join("s1", c1);
    sessions.join("s1", c2);

    assert!(sessions.acquire_lock("s1", "d1", &identity("user1")).is_some());
    assert!(sessions.acquire_lock("s1", "d2", &identity("user1")).is_some());
    assert!(sessions.acquire_lock("s1", "d3", &identity("user2")).is_some());

    let outcome = sessions.leave("s1", conn1).expect("leave succeeds");
    let mut released = outcome.released_devices.clone();
    released.sort();
    assert_eq!(released, vec!["d1".to_string(), "d2".to_string()]);
    assert!(!outcome.session_removed);
    assert_eq!(outcome.peers.len(), 1);

    // user2's lock survives
    let snapshot = sessions.snapshot("s1").unwrap();
    assert_eq!(snapshot.locks.len(), 1);
    assert_eq!(snapshot.locks[0].user_id, "user2");
}

#[test]
fn test_leave_is_idempotent() {
    let sessions = SessionManager::new();
    let (c1, _rx1) = client("s1", "user1");
    let (c2, _rx2) = client("s1", "user2");
    let conn1 = c1.conn_id;
    sessions.join("s1", c1);
    sessions.join("s1", c2);

    assert!(sessions.leave("s1", conn1).is_some());
    assert!(sessions.leave("s1", conn1).is_none(), "second leave is a no-op");
    assert!(sessions.leave("s1", conn1).is_none());
}

#[test]
fn test_version_strictly_increasing() {
    let sessions = SessionManager::new();
    let (c1, _rx1) = client("s1", "user1");
    sessions.join("s1", c1);

    assert!(sessions.acquire_lock("s1", "d1", &identity("user1")).is_some());

    let v1 = match sessions.apply_device_update(
        "s1",
        "d1",
        &identity("user1"),
        serde_json::json!({"name": "router"}),
    ) {
        Some(DeviceUpdateOutcome::Applied { version, .. }) => version,
        _ => panic!("update by lock holder should apply"),
    };
    assert_eq!(v1, 2);

    let v2 = match sessions.apply_device_update(
        "s1",
        "d1",
        &identity("user1"),
        serde_json::json!({"name": "switch"}),
    ) {
        Some(DeviceUpdateOutcome::Applied { version, .. }) => version,
        _ => panic!("update by lock holder should apply"),
    };
    assert_eq!(v2, 3);

    let v3 = sessions.apply_scan_update("s1").unwrap();
    assert_eq!(v3, 4);

    // A rejected update must not bump the version
    assert!(matches!(
        sessions.apply_device_update("s1", "d1", &identity("user2"), serde_json::json!({})),
        Some(DeviceUpdateOutcome::NotLocked)
    ));
    assert_eq!(sessions.snapshot("s1").unwrap().version, 4);

    // One change record per accepted device update, none for rejections
    assert_eq!(sessions.change_count("s1"), 2);
}

#[test]
fn test_teardown_and_rejoin_starts_fresh() {
    let sessions = SessionManager::new();
    let (c1, _rx1) = client("s1", "user1");
    let conn1 = c1.conn_id;
    sessions.join("s1", c1);

    assert!(sessions.acquire_lock("s1", "d1", &identity("user1")).is_some());
    assert!(sessions
        .apply_device_update("s1", "d1", &identity("user1"), serde_json::json!({"x": 1}))
        .is_some());
    assert_eq!(sessions.snapshot("s1").unwrap().version, 2);

    let outcome = sessions.leave("s1", conn1).unwrap();
    assert!(outcome.session_removed);
    assert!(!sessions.contains("s1"));

    // Rejoin: the session is brand new — version 1, no locks, no changes
    let (c1b, _rx1b) = client("s1", "user1");
    let joined = sessions.join("s1", c1b);
    assert_eq!(joined.snapshot.version, 1);
    assert!(joined.snapshot.locks.is_empty());
    assert_eq!(sessions.change_count("s1"), 0);
}

/// Build an AppState around a throwaway SQLite file for sweep tests.
fn test_state() -> (AppState, tempfile::TempDir) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db = scanhub_server::db::init_db(tmp_dir.path().to_str().unwrap()).expect("init db");
    let state = AppState {
        db,
        jwt_secret: vec![0u8; 32],
        sessions: SessionManager::new(),
        heartbeat_interval: Duration::from_secs(30),
    };
    (state, tmp_dir)
}

#[test]
fn test_heartbeat_sweep_reaps_dead_connections() {
    let (state, _tmp) = test_state();
    let (c1, mut rx1) = client("s1", "user1");
    let (c2, mut rx2) = client("s1", "user2");
    state.sessions.join("s1", c1.clone());
    state.sessions.join("s1", c2.clone());
    assert!(state
        .sessions
        .acquire_lock("s1", "d1", &identity("user1"))
        .is_some());

    // user1 never acknowledged the previous probe
    c1.alive.store(false, Ordering::Relaxed);

    heartbeat::sweep(&state);

    // user1 was reaped through the normal teardown path and got a close frame
    assert_eq!(state.sessions.client_count("s1"), 1);
    let to_user1 = drain(&mut rx1);
    assert!(
        to_user1
            .iter()
            .any(|m| matches!(m, Message::Close(Some(frame)) if frame.code == 1001)),
        "reaped connection should receive a close frame"
    );

    // user2 saw the departure broadcasts, then got a liveness probe
    let to_user2 = drain(&mut rx2);
    let texts: Vec<String> = to_user2
        .iter()
        .filter_map(|m| match m {
            Message::Text(t) => Some(t.to_string()),
            _ => None,
        })
        .collect();
    assert!(
        texts.iter().any(|t| t.contains("device_unlocked")),
        "user1's lock release should be broadcast"
    );
    assert!(
        texts.iter().any(|t| t.contains("user_left")),
        "user1's departure should be broadcast"
    );
    assert!(
        to_user2.iter().any(|m| matches!(m, Message::Ping(_))),
        "survivor should be probed"
    );
    assert!(!c2.alive.load(Ordering::Relaxed), "probe clears the flag");

    // No pong before the next sweep: user2 is reaped and the session dies
    heartbeat::sweep(&state);
    assert!(!state.sessions.contains("s1"));
}

#[test]
fn test_heartbeat_pong_keeps_connection_alive() {
    let (state, _tmp) = test_state();
    let (c1, mut rx1) = client("s1", "user1");
    state.sessions.join("s1", c1.clone());

    heartbeat::sweep(&state);
    assert!(!c1.alive.load(Ordering::Relaxed));
    assert!(drain(&mut rx1)
        .iter()
        .any(|m| matches!(m, Message::Ping(_))));

    // The actor sets the flag on pong receipt; emulate that here
    c1.alive.store(true, Ordering::Relaxed);

    heartbeat::sweep(&state);
    assert_eq!(state.sessions.client_count("s1"), 1, "live connection survives");
}
