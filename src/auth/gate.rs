//! Connection authentication for the WebSocket upgrade handshake.
//!
//! Extracts a credential from the upgrade request, probes persistence
//! availability, and exchanges the credential for an Identity. Each failure
//! maps to a WebSocket close code the client can distinguish.

use axum::http::{header, HeaderMap};
use serde::Deserialize;
use thiserror::Error;

use crate::auth::{jwt, Identity};
use crate::db;
use crate::state::AppState;

/// Query parameters accepted by the upgrade endpoint.
/// The token may instead arrive via cookie or Authorization header.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub scan_id: Option<String>,
    pub token: Option<String>,
}

/// Authentication failures, terminal for the connection attempt only.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing scanId parameter")]
    MissingScanId,
    #[error("Missing authentication token")]
    MissingToken,
    #[error("Service temporarily unavailable")]
    InfrastructureUnavailable,
    #[error("Invalid authentication token")]
    InvalidCredential,
}

impl AuthError {
    /// WebSocket close code for this failure. Infrastructure trouble is
    /// retryable (1013); everything else is a policy violation (1008).
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::InfrastructureUnavailable => 1013,
            _ => 1008,
        }
    }
}

/// One credential extraction strategy.
type TokenExtractor = fn(&ConnectQuery, &HeaderMap) -> Option<String>;

/// Extraction strategies in priority order. The query parameter comes
/// first because browser WebSocket clients cannot set request headers;
/// cookie and bearer header serve non-browser clients.
const TOKEN_EXTRACTORS: &[TokenExtractor] = &[from_query, from_cookie, from_bearer_header];

fn from_query(query: &ConnectQuery, _headers: &HeaderMap) -> Option<String> {
    query.token.clone().filter(|t| !t.is_empty())
}

fn from_cookie(_query: &ConnectQuery, headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "auth-token")
        .map(|(_, value)| value.to_string())
        .filter(|t| !t.is_empty())
}

fn from_bearer_header(_query: &ConnectQuery, headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.to_string())
        .filter(|t| !t.is_empty())
}

/// Authenticate a WebSocket upgrade request.
///
/// Checks, in order: scan id presence, credential presence (query param →
/// auth-token cookie → Authorization: Bearer), persistence availability
/// (before verification, short-circuiting it), then credential validity.
/// Returns the target scan id and the verified identity.
pub async fn authenticate(
    state: &AppState,
    query: &ConnectQuery,
    headers: &HeaderMap,
) -> Result<(String, Identity), AuthError> {
    let scan_id = query
        .scan_id
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::MissingScanId)?;

    let token = TOKEN_EXTRACTORS
        .iter()
        .find_map(|extract| extract(query, headers))
        .ok_or(AuthError::MissingToken)?;

    // Lazy availability probe: re-run per attempt, never on a timer.
    if !db::check_available(&state.db).await {
        return Err(AuthError::InfrastructureUnavailable);
    }

    let claims = jwt::validate_access_token(&state.jwt_secret, &token)
        .map_err(|_| AuthError::InvalidCredential)?;

    let user = db::find_user(&state.db, &claims.sub)
        .await
        .ok_or(AuthError::InvalidCredential)?;

    Ok((
        scan_id,
        Identity {
            user_id: user.id,
            username: user.username,
            email: user.email,
        },
    ))
}
