//! Shared data model for the llama-proxy supervisor.
//!
//! Everything here is serialized onto the wire (control channel, status
//! broadcasts) or into the persisted state file, so field names follow the
//! dashboard's camelCase JSON convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Current on-disk format of [`PersistedState`].
pub const PERSISTED_STATE_VERSION: u32 = 1;

/// Run state of a supervised model server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelServerStatus {
    #[default]
    Initial,
    Starting,
    Ready,
    Error,
    Crashed,
    Stopping,
}

impl ModelServerStatus {
    /// Every permitted `(from, to)` pair. Anything else is a no-op.
    pub const TRANSITIONS: [(ModelServerStatus, ModelServerStatus); 8] = [
        (Self::Initial, Self::Starting),
        (Self::Starting, Self::Ready),
        (Self::Starting, Self::Error),
        (Self::Ready, Self::Crashed),
        (Self::Ready, Self::Stopping),
        (Self::Stopping, Self::Initial),
        (Self::Error, Self::Starting),
        (Self::Crashed, Self::Starting),
    ];

    pub const ALL: [ModelServerStatus; 6] = [
        Self::Initial,
        Self::Starting,
        Self::Ready,
        Self::Error,
        Self::Crashed,
        Self::Stopping,
    ];

    pub fn can_transition_to(self, next: ModelServerStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ModelServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discoverable worker artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlamaModel {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub model_type: String,
    pub modified_at: Option<String>,
    pub available: bool,
    pub status: ModelServerStatus,
}

/// Status of one managed model id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlamaStatus {
    pub status: ModelServerStatus,
    pub models: Vec<LlamaModel>,
    pub last_error: Option<String>,
    pub retries: u32,
    /// Seconds since `started_at`, only meaningful while `ready`.
    pub uptime: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl LlamaStatus {
    /// Move to `next` if the transition table allows it.
    ///
    /// Returns `false` (and leaves `self` untouched) for any pair that is not
    /// in [`ModelServerStatus::TRANSITIONS`].
    pub fn transition(&mut self, next: ModelServerStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Uptime in whole seconds at `now`; zero unless the server is ready.
    pub fn uptime_at(&self, now: DateTime<Utc>) -> u64 {
        match (self.status, self.started_at) {
            (ModelServerStatus::Ready, Some(started)) => {
                u64::try_from((now - started).num_seconds()).unwrap_or(0)
            }
            _ => 0,
        }
    }
}

/// One telemetry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    #[serde(default)]
    pub swap_usage: f64,
    /// Used share of all mounted disks combined.
    #[serde(default)]
    pub disk_usage: f64,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    /// Set when the metrics source failed and this is a stale copy.
    #[serde(default, skip_serializing_if = "is_false")]
    pub degraded: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Snapshot of every managed model, written whole to the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: Option<DateTime<Utc>>,
    pub models: BTreeMap<String, LlamaStatus>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            saved_at: None,
            models: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_only_table_transitions_are_permitted() {
        for from in ModelServerStatus::ALL {
            for to in ModelServerStatus::ALL {
                let mut status = LlamaStatus {
                    status: from,
                    ..Default::default()
                };
                let allowed = ModelServerStatus::TRANSITIONS.contains(&(from, to));
                assert_eq!(status.transition(to), allowed, "{from} -> {to}");
                let expected = if allowed { to } else { from };
                assert_eq!(status.status, expected);
            }
        }
    }

    #[test]
    fn test_status_serializes_lowercase_camel_case() {
        let status = LlamaStatus {
            status: ModelServerStatus::Crashed,
            last_error: Some("boom".to_string()),
            retries: 2,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "crashed");
        assert_eq!(json["lastError"], "boom");
        assert_eq!(json["retries"], 2);
        assert!(json["startedAt"].is_null());
    }

    #[test]
    fn test_uptime_only_counts_while_ready() {
        let now = Utc::now();
        let mut status = LlamaStatus {
            status: ModelServerStatus::Ready,
            started_at: Some(now - Duration::seconds(42)),
            ..Default::default()
        };
        assert_eq!(status.uptime_at(now), 42);

        status.status = ModelServerStatus::Crashed;
        assert_eq!(status.uptime_at(now), 0);

        status.status = ModelServerStatus::Ready;
        status.started_at = Some(now + Duration::seconds(5));
        assert_eq!(status.uptime_at(now), 0);
    }

    #[test]
    fn test_metrics_sample_omits_degraded_flag_when_clear() {
        let sample = MetricsSample {
            cpu_usage: 12.5,
            memory_usage: 40.0,
            swap_usage: 0.0,
            disk_usage: 71.0,
            uptime_seconds: 3,
            timestamp: Utc::now(),
            degraded: false,
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert!(json.get("degraded").is_none());
        assert_eq!(json["cpuUsage"], 12.5);
        assert_eq!(json["diskUsage"], 71.0);
    }

    #[test]
    fn test_metrics_sample_without_swap_or_disk_still_parses() {
        let line = r#"{"cpuUsage":1.0,"memoryUsage":2.0,"uptimeSeconds":9,"timestamp":"2024-05-01T10:00:00Z"}"#;
        let sample: MetricsSample = serde_json::from_str(line).unwrap();
        assert_eq!(sample.swap_usage, 0.0);
        assert_eq!(sample.disk_usage, 0.0);
        assert!(!sample.degraded);
    }
}
