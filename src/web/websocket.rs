use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, Role};
use tokio_tungstenite::WebSocketStream;

use super::event_bridge::{BroadcastChannel, ControlRequest, ControlResponse, EventBridge};
use super::logger::LIVE_DELIVERY_TARGET;
use crate::{sys_debug, sys_info, sys_warn};

pub static ACTIVE_WS_CONNECTIONS: AtomicU32 = AtomicU32::new(0);

const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_millis(50);

type WsSender = SplitSink<WebSocketStream<Upgraded>, WsMessage>;

async fn send_json<T: Serialize>(ws_sender: &mut WsSender, value: &T) -> Result<(), ()> {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            sys_warn!("[WS_CONTROL] Failed to encode frame: {}", e);
            return Ok(());
        }
    };
    ws_sender.send(WsMessage::Text(text)).await.map_err(|_| ())
}

/// Serve one control-channel connection.
///
/// Each text frame is a [`ControlRequest`]; the reply is sent once the
/// supervisor has finished (and persisted) the command. Broadcasts from
/// `channel` are interleaved as they arrive. A slow client only delays
/// itself: a broadcast that can't be written quickly is skipped.
pub async fn handle_control_ws(
    upgraded: Upgraded,
    bridge: Arc<EventBridge>,
    channel: BroadcastChannel,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Subscribe before anything else so no broadcast is missed.
    let mut broadcasts = channel.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ControlResponse>();

    let conn_count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    sys_info!("[WS_CONTROL] Connection opened ({} active)", conn_count);

    loop {
        tokio::select! {
            Some(reply) = reply_rx.recv() => {
                if send_json(&mut ws_sender, &reply).await.is_err() {
                    break;
                }
            }
            message = broadcasts.recv() => {
                match message {
                    Ok(message) => {
                        match tokio::time::timeout(BROADCAST_SEND_TIMEOUT, send_json(&mut ws_sender, &message)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(())) => break,
                            Err(_) => sys_warn!(
                                target: LIVE_DELIVERY_TARGET,
                                "[WS_CONTROL] Send timed out, skipping {}",
                                message.event
                            ),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        sys_warn!(
                            target: LIVE_DELIVERY_TARGET,
                            "[WS_CONTROL] Client lagged, {} broadcast(s) dropped",
                            n
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            ws_msg = ws_receiver.next() => {
                match ws_msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ControlRequest>(&text) {
                            Ok(request) => {
                                sys_debug!("[WS_CONTROL] {} (request {:?})", request.event, request.request_id);
                                let bridge = Arc::clone(&bridge);
                                let reply_tx = reply_tx.clone();
                                tokio::spawn(async move {
                                    let response = bridge.dispatch(request).await;
                                    let _ = reply_tx.send(response);
                                });
                            }
                            Err(e) => {
                                let reply = ControlResponse::malformed(format!("invalid request frame: {e}"));
                                if send_json(&mut ws_sender, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_sender.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        sys_debug!("[WS_CONTROL] Receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let remaining = ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    sys_info!("[WS_CONTROL] Connection closed ({} active)", remaining);
    Ok(())
}
