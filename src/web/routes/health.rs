// Health and status route handlers

use std::collections::BTreeMap;
use std::convert::Infallible;

use chrono::{DateTime, Utc};
use hyper::{Body, Response, StatusCode};
use serde::Serialize;

use crate::types::LlamaStatus;
use crate::web::event_bridge::EventBridge;
use crate::web::response_helpers::json_response;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: DateTime<Utc>,
    data: BTreeMap<String, LlamaStatus>,
}

pub fn handle(bridge: &EventBridge) -> Result<Response<Body>, Infallible> {
    let body = HealthBody {
        status: "ok",
        timestamp: Utc::now(),
        data: bridge.supervisor().snapshot(),
    };
    Ok(json_response(StatusCode::OK, &body))
}

/// Same per-model map as `/health`, without the envelope.
pub fn handle_status(bridge: &EventBridge) -> Result<Response<Body>, Infallible> {
    Ok(json_response(StatusCode::OK, &bridge.supervisor().snapshot()))
}
