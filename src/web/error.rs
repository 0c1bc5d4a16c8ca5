use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by supervisor commands.
///
/// `code()` is the stable kind name sent to control-channel clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("worker binary for '{model_id}' not found at {}", path.display())]
    NotFound { model_id: String, path: PathBuf },
    #[error("'{model_id}' did not become ready within {timeout_ms} ms")]
    LaunchTimeout { model_id: String, timeout_ms: u64 },
    #[error("'{model_id}' failed to launch: {reason}")]
    LaunchFailed { model_id: String, reason: String },
    #[error("'{model_id}' could not be stopped: {reason}")]
    StopFailed { model_id: String, reason: String },
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound { .. } => "NotFound",
            Self::LaunchTimeout { .. } => "LaunchTimeout",
            Self::LaunchFailed { .. } => "LaunchFailed",
            Self::StopFailed { .. } => "StopFailed",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("metrics source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("history encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
