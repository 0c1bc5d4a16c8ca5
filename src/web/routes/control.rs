use std::convert::Infallible;

use hyper::{Body, Request, Response, StatusCode};

use super::AppState;
use crate::sys_error;
use crate::web::response_helpers::json_error;
use crate::web::websocket::handle_control_ws;
use crate::web::websocket_utils::websocket_upgrade_response;

/// WebSocket upgrade for the control channel.
///
/// Clients send commands over this socket and receive acks plus every
/// status, metrics and log broadcast on the same connection.
pub async fn handle_control_websocket(
    req: Request<Body>,
    state: AppState,
) -> Result<Response<Body>, Infallible> {
    let response = match websocket_upgrade_response(&req) {
        Ok(response) => response,
        Err(reason) => return Ok(json_error(StatusCode::BAD_REQUEST, reason)),
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = handle_control_ws(upgraded, state.bridge, state.channel).await {
                    sys_error!("[WS_CONTROL ERROR] {}", e);
                }
            }
            Err(e) => {
                sys_error!("[WS_CONTROL UPGRADE ERROR] {}", e);
            }
        }
    });

    Ok(response)
}
