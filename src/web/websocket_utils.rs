// WebSocket handshake helpers (RFC 6455)

use base64::{engine::general_purpose, Engine as _};
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use hyper::{Body, Request, Response, StatusCode};
use sha1::{Digest, Sha1};

const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Base64 of SHA-1(client key + GUID).
pub fn calculate_websocket_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID);
    general_purpose::STANDARD.encode(hasher.finalize())
}

pub fn is_websocket_upgrade(req: &Request<Body>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

pub fn get_websocket_key(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get("sec-websocket-key")
        .and_then(|k| k.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// 101 Switching Protocols for a validated handshake, or the reason it was
/// rejected.
pub fn websocket_upgrade_response(req: &Request<Body>) -> Result<Response<Body>, &'static str> {
    if !is_websocket_upgrade(req) {
        return Err("WebSocket upgrade required");
    }
    let key = get_websocket_key(req).ok_or("Missing Sec-WebSocket-Key")?;
    let accept = HeaderValue::from_str(&calculate_websocket_accept_key(&key))
        .map_err(|_| "Invalid Sec-WebSocket-Key")?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    Ok(response)
}
