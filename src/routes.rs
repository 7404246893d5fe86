use axum::Router;

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router.
///
/// The collaboration core exposes exactly two routes: the WebSocket
/// upgrade endpoint (auth via query param/cookie/header, not middleware)
/// and a health probe. Everything else about scans lives in the admin API
/// service, not here.
pub fn build_router(state: AppState) -> Router {
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new().merge(ws_routes).merge(health).with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
