// Route handler modules

pub mod control;
pub mod health;

use std::convert::Infallible;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};

use crate::sys_debug;
use crate::web::event_bridge::{BroadcastChannel, EventBridge};
use crate::web::response_helpers::{cors_preflight, json_error};

/// Per-server handles cloned into every request.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<EventBridge>,
    pub channel: BroadcastChannel,
}

pub async fn handle_request(
    req: Request<Body>,
    state: AppState,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    sys_debug!("[HTTP] {} {}", method, path);

    match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        (&Method::GET, "/health") => health::handle(&state.bridge),
        (&Method::GET, "/api/status") => health::handle_status(&state.bridge),
        (&Method::GET, "/ws") => control::handle_control_websocket(req, state).await,
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelServerStatus;
    use crate::web::state_store::StateStore;
    use crate::web::worker::supervisor::{Supervisor, SupervisorSettings};
    use crate::web::worker::testing::{Script, ScriptedLauncher};
    use regex::Regex;
    use std::time::Duration;

    fn state(dir: &std::path::Path) -> AppState {
        let supervisor = Supervisor::new(
            SupervisorSettings {
                workers_dir: dir.join("workers"),
                worker_args: Vec::new(),
                ready_pattern: Regex::new("ready").unwrap(),
                launch_timeout: Duration::from_millis(100),
                stop_grace: Duration::from_millis(20),
                kill_wait: Duration::from_millis(20),
                stderr_tail_lines: 5,
            },
            Arc::new(ScriptedLauncher::new(Script::ReadyImmediately)),
            StateStore::new(dir.join("state.json")),
        );
        let bridge = EventBridge::new(supervisor, None);
        let channel = BroadcastChannel::new(8);
        bridge.install(&channel);
        AppState { bridge, channel }
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_model_statuses() {
        let dir = std::env::temp_dir().join(format!("llama_proxy_routes_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("workers")).unwrap();
        std::fs::write(dir.join("workers").join("llama-2-7b"), b"x").unwrap();
        let state = state(&dir);
        state.bridge.supervisor().start("llama-2-7b").await.unwrap();

        let req = Request::get("/health").body(Body::empty()).unwrap();
        let response = handle_request(req, state.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["data"]["llama-2-7b"]["status"], ModelServerStatus::Ready.as_str());

        let req = Request::get("/api/status").body(Body::empty()).unwrap();
        let json = body_json(handle_request(req, state).await.unwrap()).await;
        assert_eq!(json["llama-2-7b"]["status"], "ready");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_unknown_route_and_preflight() {
        let dir = std::env::temp_dir().join(format!("llama_proxy_routes_{}", uuid::Uuid::new_v4()));
        let state = state(&dir);

        let req = Request::get("/api/chat").body(Body::empty()).unwrap();
        let response = handle_request(req, state.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/ws")
            .body(Body::empty())
            .unwrap();
        let response = handle_request(req, state.clone()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let req = Request::get("/ws").body(Body::empty()).unwrap();
        let response = handle_request(req, state).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
