use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::Append;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::config::LoggingConfig;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const LIVE_LOG_CAPACITY: usize = 512;
const RECENT_LOG_CAPACITY: usize = 1_000;

/// Target for logs about delivering live entries to clients. The live
/// transport drops these, otherwise a slow client's send warnings would be
/// queued for that same client.
pub const LIVE_DELIVERY_TARGET: &str = "llama_proxy::live_delivery";

/// One structured log record, as pushed to live log subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl LogEntry {
    pub fn from_record(record: &Record) -> Self {
        Self {
            level: record.level().to_string().to_lowercase(),
            message: record.args().to_string(),
            timestamp: Utc::now(),
            source: record.target().to_string(),
        }
    }
}

lazy_static::lazy_static! {
    static ref LIVE_LOG_TX: broadcast::Sender<LogEntry> = broadcast::channel(LIVE_LOG_CAPACITY).0;
    static ref LOG_HANDLE: Mutex<Option<Handle>> = Mutex::new(None);
    static ref RECENT_LOGS: Mutex<VecDeque<LogEntry>> = Mutex::new(VecDeque::new());
}

/// Serializes tests that assert on the shared recent-entries ring.
#[cfg(test)]
pub(crate) static RECENT_LOGS_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Subscribe to entries produced by the live-broadcast transport.
pub fn subscribe_live() -> broadcast::Receiver<LogEntry> {
    LIVE_LOG_TX.subscribe()
}

/// The most recent live entries, oldest first, at most `limit` of them.
pub fn recent_entries(limit: Option<usize>) -> Vec<LogEntry> {
    let recent = RECENT_LOGS.lock().unwrap_or_else(PoisonError::into_inner);
    let skip = limit.map_or(0, |limit| recent.len().saturating_sub(limit));
    recent.iter().skip(skip).cloned().collect()
}

/// Drop the recent entries. Returns how many were dropped.
pub fn clear_recent() -> usize {
    let mut recent = RECENT_LOGS.lock().unwrap_or_else(PoisonError::into_inner);
    let cleared = recent.len();
    recent.clear();
    cleared
}

/// log4rs appender that republishes every record on the live log channel
/// and keeps the last entries for `recent_entries`.
#[derive(Debug, Default)]
pub struct LiveBroadcastAppender;

impl Append for LiveBroadcastAppender {
    fn append(&self, record: &Record) -> anyhow::Result<()> {
        if record.target() == LIVE_DELIVERY_TARGET {
            return Ok(());
        }
        let entry = LogEntry::from_record(record);
        {
            let mut recent = RECENT_LOGS.lock().unwrap_or_else(PoisonError::into_inner);
            if recent.len() == RECENT_LOG_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }
        // No subscribers is fine.
        let _ = LIVE_LOG_TX.send(entry);
        Ok(())
    }

    fn flush(&self) {}
}

fn build_config(cfg: &LoggingConfig) -> anyhow::Result<Config> {
    let mut builder = Config::builder();
    let mut root = Root::builder();

    if cfg.console {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    if cfg.file {
        if let Some(parent) = cfg.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let archive_pattern = format!("{}.{{}}", cfg.file_path.display());
        let roller = FixedWindowRoller::builder().build(&archive_pattern, cfg.file_count)?;
        let policy = CompoundPolicy::new(
            Box::new(SizeTrigger::new(cfg.max_file_bytes)),
            Box::new(roller),
        );
        let file = RollingFileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(&cfg.file_path, Box::new(policy))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    if cfg.live_broadcast {
        builder = builder.appender(
            Appender::builder().build("live", Box::new(LiveBroadcastAppender)),
        );
        root = root.appender("live");
    }

    let level = cfg.level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    Ok(builder.build(root.build(level))?)
}

/// Install the global logger from `cfg`. Only the first call has any effect.
pub fn init_logging(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let mut handle = LOG_HANDLE
        .lock()
        .map_err(|_| anyhow::anyhow!("logger handle lock poisoned"))?;
    if handle.is_some() {
        return Ok(());
    }
    let config = build_config(cfg)?;
    *handle = Some(log4rs::init_config(config)?);
    Ok(())
}

// Convenience macros
#[macro_export]
macro_rules! sys_debug {
    ($($arg:tt)*) => {
        $crate::__log::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! sys_info {
    ($($arg:tt)*) => {
        $crate::__log::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! sys_warn {
    ($($arg:tt)*) => {
        $crate::__log::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! sys_error {
    ($($arg:tt)*) => {
        $crate::__log::error!($($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_live_appender_publishes_structured_entry() {
        let mut rx = subscribe_live();
        let appender = LiveBroadcastAppender;
        appender
            .append(
                &Record::builder()
                    .args(format_args!("worker llama-2-7b crashed"))
                    .level(Level::Warn)
                    .target("llama_proxy::web::worker")
                    .build(),
            )
            .unwrap();

        let entry = loop {
            let entry = rx.try_recv().unwrap();
            if entry.message == "worker llama-2-7b crashed" {
                break entry;
            }
        };
        assert_eq!(entry.level, "warn");
        assert_eq!(entry.source, "llama_proxy::web::worker");
    }

    #[test]
    fn test_config_with_all_transports_disabled_builds() {
        let cfg = LoggingConfig {
            console: false,
            file: false,
            live_broadcast: false,
            ..LoggingConfig::default()
        };
        assert!(build_config(&cfg).is_ok());
    }

    #[test]
    fn test_config_with_rolling_file_creates_log_dir() {
        let dir = std::env::temp_dir().join(format!("llama_proxy_logs_{}", uuid::Uuid::new_v4()));
        let cfg = LoggingConfig {
            console: false,
            file: true,
            live_broadcast: true,
            file_path: dir.join("proxy.log"),
            ..LoggingConfig::default()
        };
        assert!(build_config(&cfg).is_ok());
        assert!(dir.is_dir());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_delivery_target_is_kept_off_the_live_transport() {
        let mut rx = subscribe_live();
        let marker = format!("send timed out {}", uuid::Uuid::new_v4());
        LiveBroadcastAppender
            .append(
                &Record::builder()
                    .args(format_args!("{}", marker))
                    .level(Level::Warn)
                    .target(LIVE_DELIVERY_TARGET)
                    .build(),
            )
            .unwrap();

        while let Ok(entry) = rx.try_recv() {
            assert_ne!(entry.message, marker);
        }
        assert!(recent_entries(None).iter().all(|entry| entry.message != marker));
    }

    #[test]
    fn test_recent_entries_respect_limit() {
        let _serial = RECENT_LOGS_TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let markers: Vec<String> = (0..3)
            .map(|i| format!("recent {} {}", i, uuid::Uuid::new_v4()))
            .collect();
        for marker in &markers {
            LiveBroadcastAppender
                .append(
                    &Record::builder()
                        .args(format_args!("{}", marker))
                        .level(Level::Info)
                        .target("llama_proxy::web::telemetry")
                        .build(),
                )
                .unwrap();
        }

        let all = recent_entries(None);
        let positions: Vec<usize> = markers
            .iter()
            .filter_map(|marker| all.iter().position(|entry| &entry.message == marker))
            .collect();
        assert_eq!(positions.len(), 3);
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(recent_entries(Some(2)).len(), 2);
    }
}
