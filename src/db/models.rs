/// Database row types for all tables.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.

/// User record in the users table
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub created_at: String,
}
