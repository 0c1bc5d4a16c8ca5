// Host telemetry: periodic CPU, memory, swap and disk sampling with bounded history

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sysinfo::{Disks, System};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::config::{DEFAULT_METRICS_INTERVAL_MS, MAX_METRICS_INTERVAL_MS, MIN_METRICS_INTERVAL_MS};
use super::error::TelemetryError;
use crate::types::MetricsSample;
use crate::{sys_debug, sys_info, sys_warn};

const SAMPLE_FEED_CAPACITY: usize = 64;

/// Unclamped reading straight from a metrics source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub swap_usage: f64,
    pub disk_usage: f64,
}

pub trait MetricsSource: Send {
    fn sample(&mut self) -> Result<RawMetrics, TelemetryError>;
}

/// Whole-host usage via `sysinfo`.
pub struct SysinfoSource {
    system: System,
    disks: Disks,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime it so the first real sample is meaningful.
        system.refresh_cpu_usage();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn sample(&mut self) -> Result<RawMetrics, TelemetryError> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(TelemetryError::SourceUnavailable(
                "total memory reported as 0".to_string(),
            ));
        }
        // Hosts without swap report 0 total, which reads as 0% used.
        let swap_usage = percent_of(self.system.used_swap(), self.system.total_swap());

        self.disks.refresh(true);
        let (disk_total, disk_free) = self
            .disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, free), disk| {
                (
                    total.saturating_add(disk.total_space()),
                    free.saturating_add(disk.available_space()),
                )
            });

        Ok(RawMetrics {
            cpu_usage: f64::from(self.system.global_cpu_usage()),
            memory_usage: percent_of(self.system.used_memory(), total),
            swap_usage,
            disk_usage: percent_of(disk_total.saturating_sub(disk_free), disk_total),
        })
    }
}

/// Interval for a client-requested schedule. Missing or too-small requests
/// get the default; large ones are capped.
pub fn clamp_requested_interval(requested_ms: Option<u64>) -> Duration {
    let ms = match requested_ms {
        Some(ms) if ms >= MIN_METRICS_INTERVAL_MS => ms.min(MAX_METRICS_INTERVAL_MS),
        _ => DEFAULT_METRICS_INTERVAL_MS,
    };
    Duration::from_millis(ms)
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

struct RecorderState {
    ring: VecDeque<MetricsSample>,
    last_good: Option<MetricsSample>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Cancels the periodic schedule it was returned from.
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    token: CancellationToken,
}

impl RecordingHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct TelemetryRecorder {
    source: Mutex<Box<dyn MetricsSource>>,
    started: Instant,
    history_path: PathBuf,
    capacity: usize,
    state: Mutex<RecorderState>,
    // Single writer for the on-disk log; opened on first append.
    history_file: Mutex<Option<File>>,
    samples: broadcast::Sender<MetricsSample>,
    schedule: Mutex<Option<(CancellationToken, Duration)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TelemetryRecorder {
    pub fn new(
        source: Box<dyn MetricsSource>,
        history_path: impl Into<PathBuf>,
        capacity: usize,
    ) -> Arc<Self> {
        let (samples, _) = broadcast::channel(SAMPLE_FEED_CAPACITY);
        Arc::new(Self {
            source: Mutex::new(source),
            started: Instant::now(),
            history_path: history_path.into(),
            capacity: capacity.max(1),
            state: Mutex::new(RecorderState {
                ring: VecDeque::new(),
                last_good: None,
                last_timestamp: None,
            }),
            history_file: Mutex::new(None),
            samples,
            schedule: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsSample> {
        self.samples.subscribe()
    }

    /// Take one snapshot. Never fails: a source error yields the last good
    /// sample marked `degraded`, or a zeroed degraded sample if there is none.
    pub fn capture_metrics(&self) -> MetricsSample {
        let raw = lock(&self.source).sample();
        let mut state = lock(&self.state);

        match raw {
            Ok(raw) => {
                let sample = MetricsSample {
                    cpu_usage: clamp_percent(raw.cpu_usage),
                    memory_usage: clamp_percent(raw.memory_usage),
                    swap_usage: clamp_percent(raw.swap_usage),
                    disk_usage: clamp_percent(raw.disk_usage),
                    uptime_seconds: self.started.elapsed().as_secs(),
                    timestamp: next_timestamp(&mut state),
                    degraded: false,
                };
                state.last_good = Some(sample.clone());
                sample
            }
            Err(e) => {
                sys_warn!("[TELEMETRY] Metrics source failed: {}", e);
                match &state.last_good {
                    Some(last) => MetricsSample {
                        degraded: true,
                        ..last.clone()
                    },
                    None => MetricsSample {
                        cpu_usage: 0.0,
                        memory_usage: 0.0,
                        swap_usage: 0.0,
                        disk_usage: 0.0,
                        uptime_seconds: self.started.elapsed().as_secs(),
                        timestamp: next_timestamp(&mut state),
                        degraded: true,
                    },
                }
            }
        }
    }

    /// Capture, record and publish one sample.
    ///
    /// Degraded samples are published but kept out of the history.
    pub fn record_once(&self) -> MetricsSample {
        let sample = self.capture_metrics();
        if !sample.degraded {
            {
                let mut state = lock(&self.state);
                state.ring.push_back(sample.clone());
                while state.ring.len() > self.capacity {
                    state.ring.pop_front();
                }
            }
            if let Err(e) = self.append_history(&sample) {
                sys_warn!(
                    "[TELEMETRY] Failed to append to {}: {}",
                    self.history_path.display(),
                    e
                );
            }
        }
        let _ = self.samples.send(sample.clone());
        sample
    }

    fn append_history(&self, sample: &MetricsSample) -> Result<(), TelemetryError> {
        let mut line = serde_json::to_string(sample)?;
        line.push('\n');

        let mut file = lock(&self.history_file);
        if file.is_none() {
            if let Some(parent) = self.history_path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            *file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.history_path)?,
            );
        }
        if let Some(file) = file.as_mut() {
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }
        Ok(())
    }

    /// Record every `interval` until the returned handle is cancelled.
    ///
    /// The interval is clamped to the configured bounds. Starting a new
    /// schedule cancels the previous one.
    pub fn start_periodic_recording(self: &Arc<Self>, interval: Duration) -> RecordingHandle {
        let interval = interval.clamp(
            Duration::from_millis(MIN_METRICS_INTERVAL_MS),
            Duration::from_millis(MAX_METRICS_INTERVAL_MS),
        );
        let token = CancellationToken::new();
        if let Some((previous, _)) = lock(&self.schedule).replace((token.clone(), interval)) {
            previous.cancel();
        }

        let recorder = Arc::clone(self);
        let cancelled = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let recorder = Arc::clone(&recorder);
                        if let Err(e) = tokio::task::spawn_blocking(move || recorder.record_once()).await {
                            sys_warn!("[TELEMETRY] Sampling task failed: {}", e);
                        }
                    }
                }
            }
            sys_debug!("[TELEMETRY] Periodic recording stopped");
        });

        sys_info!("[TELEMETRY] Recording every {:?}", interval);
        RecordingHandle { token }
    }

    pub fn stop_periodic_recording(&self) {
        if let Some((token, _)) = lock(&self.schedule).take() {
            token.cancel();
        }
    }

    /// Interval of the running schedule, if one is running.
    pub fn current_interval(&self) -> Option<Duration> {
        lock(&self.schedule)
            .as_ref()
            .filter(|(token, _)| !token.is_cancelled())
            .map(|(_, interval)| *interval)
    }

    /// Samples oldest to newest, at most the last `limit`.
    ///
    /// A limit the in-memory ring can satisfy is served from the ring.
    /// Otherwise the on-disk log is streamed, keeping only the last `limit`
    /// parseable lines; if it can't be read the ring is all there is.
    pub fn read_history(&self, limit: Option<usize>) -> Vec<MetricsSample> {
        if let Some(limit) = limit {
            let state = lock(&self.state);
            if state.ring.len() >= limit {
                return state.ring.iter().skip(state.ring.len() - limit).cloned().collect();
            }
        }

        let mut samples: Vec<MetricsSample> = match self.read_log_tail(limit) {
            Ok(samples) => samples,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    sys_warn!(
                        "[TELEMETRY] Cannot read {}, using in-memory history: {}",
                        self.history_path.display(),
                        e
                    );
                }
                lock(&self.state).ring.iter().cloned().collect()
            }
        };

        samples.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if let Some(limit) = limit {
            if samples.len() > limit {
                samples.drain(..samples.len() - limit);
            }
        }
        samples
    }

    fn read_log_tail(&self, limit: Option<usize>) -> std::io::Result<Vec<MetricsSample>> {
        let reader = BufReader::new(File::open(&self.history_path)?);
        let mut tail = VecDeque::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // A torn final line from an interrupted append is skipped.
            let Ok(sample) = serde_json::from_str::<MetricsSample>(line) else {
                continue;
            };
            tail.push_back(sample);
            if limit.is_some_and(|limit| tail.len() > limit) {
                tail.pop_front();
            }
        }
        Ok(tail.into())
    }
}

fn next_timestamp(state: &mut RecorderState) -> DateTime<Utc> {
    let now = Utc::now();
    let timestamp = match state.last_timestamp {
        Some(last) if last > now => last,
        _ => now,
    };
    state.last_timestamp = Some(timestamp);
    timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed script of readings; `None` means the source fails.
    struct ScriptedSource {
        readings: Vec<Option<(f64, f64)>>,
        next: usize,
    }

    impl ScriptedSource {
        fn boxed(readings: Vec<Option<(f64, f64)>>) -> Box<dyn MetricsSource> {
            Box::new(Self { readings, next: 0 })
        }
    }

    impl MetricsSource for ScriptedSource {
        fn sample(&mut self) -> Result<RawMetrics, TelemetryError> {
            let reading = self.readings[self.next % self.readings.len()];
            self.next += 1;
            reading
                .map(|(cpu_usage, memory_usage)| RawMetrics {
                    cpu_usage,
                    memory_usage,
                    swap_usage: 0.0,
                    disk_usage: memory_usage,
                })
                .ok_or_else(|| TelemetryError::SourceUnavailable("scripted".to_string()))
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("llama_proxy_tel_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn cleanup(path: &std::path::Path) {
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_capture_clamps_percentages() {
        let path = temp_path("history.jsonl");
        let recorder = TelemetryRecorder::new(
            ScriptedSource::boxed(vec![Some((150.0, -5.0)), Some((f64::NAN, 42.5))]),
            &path,
            10,
        );

        let first = recorder.capture_metrics();
        assert_eq!(first.cpu_usage, 100.0);
        assert_eq!(first.memory_usage, 0.0);
        assert!(!first.degraded);

        let second = recorder.capture_metrics();
        assert_eq!(second.cpu_usage, 0.0);
        assert_eq!(second.memory_usage, 42.5);
        assert!(second.timestamp >= first.timestamp);
        assert!(DateTime::parse_from_rfc3339(&second.timestamp.to_rfc3339()).is_ok());

        cleanup(&path);
    }

    #[test]
    fn test_source_failure_returns_degraded_copy() {
        let path = temp_path("history.jsonl");
        let recorder = TelemetryRecorder::new(
            ScriptedSource::boxed(vec![Some((30.0, 40.0)), None]),
            &path,
            10,
        );

        let good = recorder.capture_metrics();
        let degraded = recorder.capture_metrics();
        assert!(degraded.degraded);
        assert_eq!(degraded.cpu_usage, good.cpu_usage);
        assert_eq!(degraded.timestamp, good.timestamp);

        cleanup(&path);
    }

    #[test]
    fn test_failure_before_any_sample_is_zeroed() {
        let path = temp_path("history.jsonl");
        let recorder = TelemetryRecorder::new(ScriptedSource::boxed(vec![None]), &path, 10);

        let sample = recorder.record_once();
        assert!(sample.degraded);
        assert_eq!(sample.cpu_usage, 0.0);
        assert_eq!(sample.memory_usage, 0.0);
        assert!(recorder.read_history(None).is_empty());

        cleanup(&path);
    }

    #[test]
    fn test_missing_history_is_empty() {
        let path = temp_path("never_written.jsonl");
        let recorder = TelemetryRecorder::new(ScriptedSource::boxed(vec![Some((1.0, 1.0))]), &path, 10);
        assert!(recorder.read_history(Some(5)).is_empty());
        cleanup(&path);
    }

    #[test]
    fn test_history_limit_and_partial_last_line() {
        let path = temp_path("history.jsonl");
        let recorder = TelemetryRecorder::new(
            ScriptedSource::boxed(vec![Some((10.0, 20.0)), Some((11.0, 21.0))]),
            &path,
            100,
        );
        for _ in 0..5 {
            recorder.record_once();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"cpuUsage\": 12.0, \"memo").unwrap();
        }

        let all = recorder.read_history(None);
        assert_eq!(all.len(), 5);

        let recent = recorder.read_history(Some(3));
        assert_eq!(recent.len(), 3);
        assert!(recent.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(recent.last(), all.last());

        cleanup(&path);
    }

    #[test]
    fn test_unreadable_log_falls_back_to_bounded_ring() {
        // A directory in place of the log: appends and reads both fail.
        let path = temp_path("history.jsonl");
        fs::create_dir_all(&path).unwrap();
        let recorder = TelemetryRecorder::new(ScriptedSource::boxed(vec![Some((5.0, 6.0))]), &path, 3);

        for _ in 0..5 {
            recorder.record_once();
        }
        let history = recorder.read_history(None);
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|s| s.cpu_usage == 5.0));

        cleanup(&path);
    }

    #[tokio::test]
    async fn test_periodic_recording_publishes_and_replaces() {
        let path = temp_path("history.jsonl");
        let recorder = TelemetryRecorder::new(ScriptedSource::boxed(vec![Some((7.0, 8.0))]), &path, 10);
        let mut feed = recorder.subscribe();

        let first = recorder.start_periodic_recording(Duration::from_millis(1));
        let second = recorder.start_periodic_recording(Duration::from_millis(100));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        for _ in 0..2 {
            let sample = tokio::time::timeout(Duration::from_secs(2), feed.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(sample.cpu_usage, 7.0);
        }
        second.cancel();
        assert!(!recorder.read_history(None).is_empty());

        cleanup(&path);
    }

    #[test]
    fn test_requested_interval_is_clamped() {
        assert_eq!(clamp_requested_interval(None), Duration::from_millis(DEFAULT_METRICS_INTERVAL_MS));
        assert_eq!(clamp_requested_interval(Some(10)), Duration::from_millis(DEFAULT_METRICS_INTERVAL_MS));
        assert_eq!(clamp_requested_interval(Some(500)), Duration::from_millis(500));
        assert_eq!(clamp_requested_interval(Some(600_000)), Duration::from_secs(60));
    }

    #[test]
    fn test_limited_history_is_served_from_ring() {
        let path = temp_path("history.jsonl");
        let recorder = TelemetryRecorder::new(ScriptedSource::boxed(vec![Some((3.0, 4.0))]), &path, 10);
        for _ in 0..5 {
            recorder.record_once();
        }
        fs::remove_file(&path).unwrap();

        let recent = recorder.read_history(Some(3));
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].disk_usage, 4.0);
        assert!(recorder.read_history(Some(0)).is_empty());
        // More than the ring holds goes to the log, which is gone now.
        assert_eq!(recorder.read_history(Some(20)).len(), 5);

        cleanup(&path);
    }

    #[tokio::test]
    async fn test_current_interval_tracks_schedule() {
        let path = temp_path("history.jsonl");
        let recorder = TelemetryRecorder::new(ScriptedSource::boxed(vec![Some((1.0, 2.0))]), &path, 10);
        assert_eq!(recorder.current_interval(), None);

        let handle = recorder.start_periodic_recording(Duration::from_millis(250));
        assert_eq!(recorder.current_interval(), Some(Duration::from_millis(250)));
        recorder.start_periodic_recording(Duration::from_secs(600));
        assert_eq!(recorder.current_interval(), Some(Duration::from_secs(60)));
        assert!(handle.is_cancelled());

        recorder.stop_periodic_recording();
        assert_eq!(recorder.current_interval(), None);

        cleanup(&path);
    }
}
