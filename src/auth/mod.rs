pub mod gate;
pub mod jwt;

/// Authenticated identity attached to a connection for its entire lifetime.
/// Produced by the auth gate from a verified credential and the users table.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub email: String,
}
