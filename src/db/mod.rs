pub mod migrations;
pub mod models;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Type alias for the shared database connection.
/// rusqlite is synchronous — we wrap in Arc<Mutex> for thread safety
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

/// Initialize the SQLite database: create data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    // Ensure data directory exists
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("scanhub.db");
    let mut conn = Connection::open(&db_path)?;

    // Enable WAL mode for better concurrent read performance
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // Enable foreign key enforcement
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // Run migrations
    let migrations = migrations::migrations();
    migrations.to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// Cheap persistence availability probe. The auth gate runs this before
/// verifying a credential so that new connections are rejected with a
/// try-again-later close code while the DB is unreachable, without the
/// failure ever touching established sessions.
pub async fn check_available(db: &DbPool) -> bool {
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = match db.lock() {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
    })
    .await
    .unwrap_or(false)
}

/// Look up a user row by id. Returns None if the row is absent or the
/// database is unavailable.
pub async fn find_user(db: &DbPool, user_id: &str) -> Option<models::User> {
    let db = db.clone();
    let uid = user_id.to_string();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().ok()?;
        conn.query_row(
            "SELECT id, username, email, created_at FROM users WHERE id = ?1",
            rusqlite::params![uid],
            |row| {
                Ok(models::User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    created_at: row.get(3)?,
                })
            },
        )
        .ok()
    })
    .await
    .ok()
    .flatten()
}

/// Insert a user row. Used by operator-side seeding and by tests; the
/// collaboration core itself never writes to the users table.
pub fn seed_user(
    db: &DbPool,
    user_id: &str,
    username: &str,
    email: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {}", e))?;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO users (id, username, email, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![user_id, username, email, now],
    )?;
    Ok(())
}
