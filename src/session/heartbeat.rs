//! Heartbeat-based liveness detection.
//!
//! One process-wide sweep task, not a timer per connection: each tick
//! first reaps every connection that failed to acknowledge the previous
//! probe, then flags and probes the survivors. A dead connection is
//! therefore detected within two periods at worst. Reaping runs the same
//! teardown path as an explicit disconnect, so departure broadcasts and
//! lock releases are identical either way.

use axum::extract::ws::{CloseFrame, Message};
use tokio::task::JoinHandle;

use crate::state::AppState;
use crate::ws::actor;

/// Close code sent to reaped connections (going away).
const CLOSE_HEARTBEAT_TIMEOUT: u16 = 1001;

/// Spawn the sweep task. The returned handle must be aborted on server
/// shutdown so no tick fires during teardown.
pub fn spawn(state: AppState) -> JoinHandle<()> {
    let period = state.heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // Skip the first immediate tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&state);
        }
    })
}

/// One sweep pass. Public so tests can drive it without the timer.
pub fn sweep(state: &AppState) {
    // Pass 1: reap connections that never acknowledged the previous probe.
    for (scan_id, conn_id) in state.sessions.dead_connections() {
        tracing::warn!(
            scan_id = %scan_id,
            conn_id = %conn_id,
            "Heartbeat timeout, reaping connection"
        );
        if let Some(outcome) = actor::disconnect(state, &scan_id, conn_id) {
            let _ = outcome.tx.send(Message::Close(Some(CloseFrame {
                code: CLOSE_HEARTBEAT_TIMEOUT,
                reason: "Heartbeat timeout".into(),
            })));
        }
    }

    // Pass 2: flag the survivors not-alive and probe them. A pong flips
    // the flag back before the next pass.
    let probed = state.sessions.probe_connections();
    if probed > 0 {
        tracing::trace!(connections = probed, "Sent liveness probes");
    }
}
