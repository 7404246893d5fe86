use std::time::Duration;

use crate::db::DbPool;
use crate::session::SessionManager;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// In-memory collaboration sessions keyed by scan id
    pub sessions: SessionManager,
    /// Period of the heartbeat sweep
    pub heartbeat_interval: Duration,
}
