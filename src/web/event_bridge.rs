//! Control-event routing and status fan-out.
//!
//! Requests arrive as [`ControlRequest`]s, legacy `router:*` names are mapped
//! onto their `llama:*` equivalents, and the supervisor's answer goes back as
//! an [`Ack`]. Whenever a command (or the exit observer) changes a model's
//! status, the new status is pushed to every installed [`BroadcastChannel`]
//! under both the canonical and the legacy event name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::logger;
use super::telemetry::{clamp_requested_interval, TelemetryRecorder};
use super::worker::supervisor::{Command as SupervisorCommand, SharedSupervisor};
use crate::types::LlamaStatus;
use crate::{sys_debug, sys_info, sys_warn};

pub const LLAMA_START: &str = "llama:start";
pub const LLAMA_STOP: &str = "llama:stop";
pub const LLAMA_RESTART: &str = "llama:restart";
pub const LLAMA_STATUS: &str = "llama:status";
pub const ROUTER_STATUS: &str = "router:status";
pub const METRICS_GET: &str = "metrics:get";
pub const METRICS_HISTORY: &str = "metrics:history";
pub const METRICS_UPDATE: &str = "metrics:update";
pub const METRICS_SUBSCRIBE: &str = "metrics:subscribe";
pub const METRICS_UPDATE_INTERVAL: &str = "metrics:update-interval";
pub const LOGS_ENTRY: &str = "logs:entry";
pub const LOGS_GET: &str = "logs:get";
pub const LOGS_CLEAR: &str = "logs:clear";

pub const PROTOCOL_ERROR: &str = "BridgeProtocolError";

/// Deprecated name -> canonical name.
const EVENT_ALIASES: [(&str, &str); 4] = [
    ("router:start", LLAMA_START),
    ("router:stop", LLAMA_STOP),
    ("router:restart", LLAMA_RESTART),
    (ROUTER_STATUS, LLAMA_STATUS),
];

pub fn canonical_event(event: &str) -> &str {
    EVENT_ALIASES
        .iter()
        .find(|(legacy, _)| *legacy == event)
        .map_or(event, |(_, canonical)| *canonical)
}

pub fn legacy_event(canonical: &str) -> Option<&'static str> {
    EVENT_ALIASES
        .iter()
        .find(|(_, c)| *c == canonical)
        .map(|(legacy, _)| *legacy)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelCommand {
    Start,
    Stop,
    Restart,
    Status,
}

impl ModelCommand {
    fn supervisor_command(self) -> Option<SupervisorCommand> {
        match self {
            Self::Start => Some(SupervisorCommand::Start),
            Self::Stop => Some(SupervisorCommand::Stop),
            Self::Restart => Some(SupervisorCommand::Restart),
            Self::Status => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Model(ModelCommand),
    MetricsGet,
    MetricsHistory,
    MetricsSubscribe,
    MetricsUpdateInterval,
    LogsGet,
    LogsClear,
}

impl Command {
    fn parse(canonical: &str) -> Option<Self> {
        Some(match canonical {
            LLAMA_START => Self::Model(ModelCommand::Start),
            LLAMA_STOP => Self::Model(ModelCommand::Stop),
            LLAMA_RESTART => Self::Model(ModelCommand::Restart),
            LLAMA_STATUS => Self::Model(ModelCommand::Status),
            METRICS_GET => Self::MetricsGet,
            METRICS_HISTORY => Self::MetricsHistory,
            METRICS_SUBSCRIBE => Self::MetricsSubscribe,
            METRICS_UPDATE_INTERVAL => Self::MetricsUpdateInterval,
            LOGS_GET => Self::LogsGet,
            LOGS_CLEAR => Self::LogsClear,
            _ => return None,
        })
    }
}

/// One inbound frame. `requestId` is opaque: clients send numbers or
/// strings, and the same JSON value is echoed in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub event: String,
    #[serde(default)]
    pub request_id: Option<Value>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(code.to_string()),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub event: String,
    pub request_id: Option<Value>,
    pub ack: Ack,
}

impl ControlResponse {
    /// Reply to a frame that could not be decoded into a request at all.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            event: "error".to_string(),
            request_id: None,
            ack: Ack::err(PROTOCOL_ERROR, message),
        }
    }
}

/// Server-initiated push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub data: Value,
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Fan-out channel. Clones share identity, so installing a clone of an
/// already-installed channel is a no-op.
#[derive(Debug, Clone)]
pub struct BroadcastChannel {
    id: u64,
    tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }

    /// Fire and forget; with no subscribers the message is dropped.
    pub fn publish(&self, message: BroadcastMessage) {
        let _ = self.tx.send(message);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload<'a> {
    model_id: &'a str,
    #[serde(flatten)]
    status: &'a LlamaStatus,
}

fn status_payload(model_id: &str, status: &LlamaStatus) -> Value {
    serde_json::to_value(StatusPayload { model_id, status }).unwrap_or_default()
}

/// `data.limit`: absent or null means no limit.
fn parse_limit(data: &Value) -> Result<Option<usize>, Ack> {
    match data.get("limit") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| Ack::err(PROTOCOL_ERROR, "data.limit must be a non-negative integer")),
    }
}

/// `data.interval` in milliseconds, as a number or a numeric string.
fn requested_interval_ms(data: &Value) -> Option<u64> {
    let value = data.get("interval")?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

/// Replace the recording schedule with the requested interval. Every
/// connected client shares the one schedule.
fn reschedule(recorder: &Arc<TelemetryRecorder>, data: &Value) -> Ack {
    let interval = clamp_requested_interval(requested_interval_ms(data));
    recorder.start_periodic_recording(interval);
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    Ack::ok(serde_json::json!({ "interval": interval_ms }))
}

fn to_ack<T: Serialize>(value: &T) -> Ack {
    match serde_json::to_value(value) {
        Ok(data) => Ack::ok(data),
        Err(e) => Ack::err(PROTOCOL_ERROR, format!("cannot encode reply: {e}")),
    }
}

pub struct EventBridge {
    supervisor: SharedSupervisor,
    telemetry: Option<Arc<TelemetryRecorder>>,
    channels: Mutex<Vec<BroadcastChannel>>,
}

impl EventBridge {
    pub fn new(supervisor: SharedSupervisor, telemetry: Option<Arc<TelemetryRecorder>>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            telemetry,
            channels: Mutex::new(Vec::new()),
        })
    }

    pub fn supervisor(&self) -> &SharedSupervisor {
        &self.supervisor
    }

    /// Attach a broadcast channel. Returns `false` if it was already attached.
    pub fn install(&self, channel: &BroadcastChannel) -> bool {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.iter().any(|c| c.id == channel.id) {
            sys_debug!("[BRIDGE] Channel {} already installed", channel.id);
            return false;
        }
        channels.push(channel.clone());
        sys_info!("[BRIDGE] Installed on channel {}", channel.id);
        true
    }

    pub async fn dispatch(&self, request: ControlRequest) -> ControlResponse {
        let ack = self.execute(&request.event, &request.data).await;
        ControlResponse {
            event: format!("{}:result", request.event),
            request_id: request.request_id,
            ack,
        }
    }

    async fn execute(&self, event: &str, data: &Value) -> Ack {
        let canonical = canonical_event(event);
        if canonical != event {
            sys_debug!("[BRIDGE] Legacy event '{}' mapped to '{}'", event, canonical);
        }
        let command = match Command::parse(canonical) {
            Some(command) => command,
            None => {
                sys_warn!("[BRIDGE] Unknown event '{}'", event);
                return Ack::err(PROTOCOL_ERROR, format!("unknown event '{event}'"));
            }
        };

        match command {
            Command::Model(command) => self.execute_model_command(command, data).await,
            Command::LogsGet => match parse_limit(data) {
                Ok(limit) => to_ack(&logger::recent_entries(limit)),
                Err(ack) => ack,
            },
            Command::LogsClear => {
                let cleared = logger::clear_recent();
                sys_info!("[BRIDGE] Cleared {} recent log entries", cleared);
                Ack::ok(serde_json::json!({ "cleared": cleared }))
            }
            Command::MetricsGet => self.with_recorder(|recorder| to_ack(&recorder.capture_metrics())),
            Command::MetricsHistory => self.with_recorder(|recorder| match parse_limit(data) {
                Ok(limit) => to_ack(&recorder.read_history(limit)),
                Err(ack) => ack,
            }),
            Command::MetricsSubscribe => self.with_recorder(|recorder| reschedule(recorder, data)),
            Command::MetricsUpdateInterval => self.with_recorder(|recorder| {
                if recorder.current_interval().is_none() {
                    Ack::err(PROTOCOL_ERROR, "metrics recording is not running")
                } else {
                    reschedule(recorder, data)
                }
            }),
        }
    }

    fn with_recorder(&self, f: impl FnOnce(&Arc<TelemetryRecorder>) -> Ack) -> Ack {
        match &self.telemetry {
            Some(recorder) => f(recorder),
            None => Ack::err(PROTOCOL_ERROR, "telemetry is not enabled"),
        }
    }

    async fn execute_model_command(&self, command: ModelCommand, data: &Value) -> Ack {
        let Some(model_id) = data.get("modelId").and_then(Value::as_str) else {
            return Ack::err(PROTOCOL_ERROR, "data.modelId must be a string");
        };

        let result = match command.supervisor_command() {
            Some(supervisor_command) => {
                let outcome = self.supervisor.run(supervisor_command, model_id).await;
                if let Some(status) = &outcome.changed {
                    self.broadcast_status(model_id, status);
                }
                outcome.result
            }
            None => self.supervisor.status(model_id),
        };

        match result {
            Ok(status) => Ack::ok(status_payload(model_id, &status)),
            Err(e) => {
                sys_warn!("[BRIDGE] {:?} for '{}' failed: {}", command, model_id, e);
                Ack::err(e.code(), e.to_string())
            }
        }
    }

    /// Push `status` under both status event names.
    pub fn broadcast_status(&self, model_id: &str, status: &LlamaStatus) {
        let data = status_payload(model_id, status);
        self.publish(LLAMA_STATUS, data.clone());
        self.publish(ROUTER_STATUS, data);
    }

    fn publish(&self, event: &str, data: Value) {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        for channel in channels.iter() {
            channel.publish(BroadcastMessage {
                event: event.to_string(),
                data: data.clone(),
            });
        }
    }

    /// Forward the supervisor change feed, telemetry samples and (optionally)
    /// live log entries to the installed channels.
    pub fn spawn_forwarders(self: &Arc<Self>, live_logs: bool) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let bridge = Arc::clone(self);
        let mut changes = self.supervisor.subscribe_changes();
        tasks.push(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => bridge.broadcast_status(&change.model_id, &change.status),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        sys_warn!("[BRIDGE] Status feed lagged, {} change(s) skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        if let Some(recorder) = &self.telemetry {
            let bridge = Arc::clone(self);
            let mut samples = recorder.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    match samples.recv().await {
                        Ok(sample) => match serde_json::to_value(&sample) {
                            Ok(data) => bridge.publish(METRICS_UPDATE, data),
                            Err(e) => sys_warn!("[BRIDGE] Cannot encode sample: {}", e),
                        },
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        if live_logs {
            let bridge = Arc::clone(self);
            let mut entries = logger::subscribe_live();
            tasks.push(tokio::spawn(async move {
                loop {
                    match entries.recv().await {
                        Ok(entry) => {
                            if let Ok(data) = serde_json::to_value(&entry) {
                                bridge.publish(LOGS_ENTRY, data);
                            }
                        }
                        // Logging here would feed back into this same stream.
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        tasks
    }
}
