// Supervisor server modules

pub mod config;
pub mod discovery;
pub mod error;
pub mod event_bridge;
pub mod logger;
pub mod response_helpers;
pub mod routes;
pub mod state_store;
pub mod telemetry;
pub mod websocket;
pub mod websocket_utils;
pub mod worker;

pub use config::{ConfigError, LoggingConfig, ProxyConfig};
pub use error::{StoreError, SupervisorError, TelemetryError};
pub use event_bridge::{BroadcastChannel, ControlRequest, ControlResponse, EventBridge};
pub use worker::supervisor::{SharedSupervisor, Supervisor};
