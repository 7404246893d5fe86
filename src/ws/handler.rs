use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};

use crate::auth::gate::{self, ConnectQuery};
use crate::state::AppState;
use crate::ws::actor;

/// GET /ws?scanId=SCAN&token=JWT
/// WebSocket upgrade endpoint. Authenticates before the upgrade completes;
/// the credential may arrive as a query parameter, an auth-token cookie,
/// or an Authorization: Bearer header, in that order.
/// On auth failure, upgrades then immediately closes with the failure's
/// close code (1008 policy violation, 1013 try again later) so the client
/// can tell a bad credential from a transient outage.
/// On success, spawns an actor for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match gate::authenticate(&state, &params, &headers).await {
        Ok((scan_id, identity)) => {
            tracing::info!(
                user_id = %identity.user_id,
                scan_id = %scan_id,
                "WebSocket connection authenticated"
            );
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, scan_id, identity))
        }
        Err(err) => {
            let close_code = err.close_code();
            let reason = err.to_string();

            tracing::warn!(
                close_code = close_code,
                reason = %reason,
                "WebSocket auth failed"
            );

            // Upgrade the connection, then immediately close with the error code
            ws.on_upgrade(move |mut socket| async move {
                let close_frame = CloseFrame {
                    code: close_code,
                    reason: reason.into(),
                };
                let _ = socket.send(Message::Close(Some(close_frame))).await;
            })
        }
    }
}
