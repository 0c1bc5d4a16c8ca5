//! Per-model state machine and process ownership.
//!
//! Every command for a model id runs under that id's async command lock, so
//! `start`/`stop`/`restart` never interleave for one id. The exit observer
//! spawned for each launch also takes the command lock before it reconciles,
//! which means it always sees the state a finished command left behind.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::timeout;

use super::process_manager::{
    wait_for_exit, ExitInfo, LaunchSpec, ProcessHandle, ProcessLauncher, SpawnedProcess,
};
use crate::types::{LlamaModel, LlamaStatus, ModelServerStatus, PersistedState};
use crate::web::discovery::{discover_workers, is_readable_file, worker_binary_path};
use crate::web::error::SupervisorError;
use crate::web::state_store::StateStore;
use crate::{sys_debug, sys_error, sys_info, sys_warn};

pub const MAX_MODEL_ID_LEN: usize = 128;
const CHANGE_FEED_CAPACITY: usize = 64;
const RECOVERY_REASON: &str = "supervisor restarted";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub workers_dir: PathBuf,
    pub worker_args: Vec<String>,
    pub ready_pattern: Regex,
    pub launch_timeout: Duration,
    pub stop_grace: Duration,
    pub kill_wait: Duration,
    pub stderr_tail_lines: usize,
}

/// A transition made by the exit observer rather than by a command.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub model_id: String,
    pub status: LlamaStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
}

/// What a command returned, plus the status it left behind when it changed
/// anything observable. Both are taken under the model's command lock.
#[derive(Debug)]
pub struct CommandOutcome {
    pub result: Result<LlamaStatus, SupervisorError>,
    pub changed: Option<LlamaStatus>,
}

// Everything but the derived uptime, which ticks on its own.
type StatusFingerprint = (ModelServerStatus, u32, Option<DateTime<Utc>>, Option<String>);

fn fingerprint(status: &LlamaStatus) -> StatusFingerprint {
    (
        status.status,
        status.retries,
        status.started_at,
        status.last_error.clone(),
    )
}

struct RunningProcess {
    handle: Arc<dyn ProcessHandle>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

struct EntryState {
    status: LlamaStatus,
    /// Bumped on every launch; exit notifications carry the value they were
    /// spawned with.
    generation: u64,
    process: Option<RunningProcess>,
}

struct ModelEntry {
    command_lock: tokio::sync::Mutex<()>,
    state: Mutex<EntryState>,
}

impl ModelEntry {
    fn new(status: LlamaStatus) -> Self {
        Self {
            command_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(EntryState {
                status,
                generation: 0,
                process: None,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum ReadyOutcome {
    Ready,
    Exited(ExitInfo),
}

pub type SharedSupervisor = Arc<Supervisor>;

pub struct Supervisor {
    settings: SupervisorSettings,
    launcher: Arc<dyn ProcessLauncher>,
    store: StateStore,
    entries: RwLock<HashMap<String, Arc<ModelEntry>>>,
    catalog: RwLock<Vec<LlamaModel>>,
    persist_lock: tokio::sync::Mutex<()>,
    changes: broadcast::Sender<StatusChange>,
}

/// ASCII alphanumerics, `-` and `_`, 1 to 128 characters.
pub fn is_valid_model_id(model_id: &str) -> bool {
    !model_id.is_empty()
        && model_id.len() <= MAX_MODEL_ID_LEN
        && model_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn validate_model_id(model_id: &str) -> Result<(), SupervisorError> {
    if is_valid_model_id(model_id) {
        Ok(())
    } else {
        Err(SupervisorError::Validation(format!(
            "model id must be 1-{MAX_MODEL_ID_LEN} characters of [A-Za-z0-9_-]"
        )))
    }
}

fn describe_failure(tail: Vec<String>, fallback: &str) -> String {
    if tail.is_empty() {
        fallback.to_string()
    } else {
        tail.join("\n")
    }
}

impl Supervisor {
    /// Build the supervisor and reconcile whatever the last run persisted.
    ///
    /// No process from a previous run is adopted: `ready` becomes `crashed`,
    /// `starting` becomes `error` and `stopping` completes to `initial`.
    pub fn new(
        settings: SupervisorSettings,
        launcher: Arc<dyn ProcessLauncher>,
        store: StateStore,
    ) -> SharedSupervisor {
        let persisted = store.load();
        let mut reconciled = false;
        let mut entries = HashMap::new();

        for (model_id, mut status) in persisted.models {
            if !is_valid_model_id(&model_id) {
                sys_warn!("[SUPERVISOR] Dropping persisted entry with invalid id {:?}", model_id);
                reconciled = true;
                continue;
            }
            let next = match status.status {
                ModelServerStatus::Ready => Some(ModelServerStatus::Crashed),
                ModelServerStatus::Starting => Some(ModelServerStatus::Error),
                ModelServerStatus::Stopping => Some(ModelServerStatus::Initial),
                _ => None,
            };
            if let Some(next) = next {
                sys_info!(
                    "[SUPERVISOR] Recovered '{}' as {} (was {})",
                    model_id,
                    next,
                    status.status
                );
                status.transition(next);
                if next != ModelServerStatus::Initial {
                    status.last_error = Some(RECOVERY_REASON.to_string());
                }
                status.started_at = None;
                reconciled = true;
            }
            status.uptime = 0;
            status.models.clear();
            entries.insert(model_id, Arc::new(ModelEntry::new(status)));
        }

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let supervisor = Arc::new(Self {
            settings,
            launcher,
            store,
            entries: RwLock::new(entries),
            catalog: RwLock::new(Vec::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            changes,
        });
        supervisor.refresh_catalog();
        if reconciled {
            // Nothing else holds the supervisor yet, so write in place.
            if let Err(e) = supervisor.store.persist_state(&supervisor.persisted_state()) {
                sys_error!("[SUPERVISOR] Failed to persist recovered state: {}", e);
            }
        }
        supervisor
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Rescan the workers directory.
    pub fn refresh_catalog(&self) -> Vec<LlamaModel> {
        let models = discover_workers(&self.settings.workers_dir);
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = models.clone();
        models
    }

    pub fn catalog(&self) -> Vec<LlamaModel> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current status of `model_id`. Unknown ids report the default status.
    pub fn status(&self, model_id: &str) -> Result<LlamaStatus, SupervisorError> {
        validate_model_id(model_id)?;
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_id)
            .cloned();
        Ok(match entry {
            Some(entry) => self.view(model_id, &entry.lock_state().status),
            None => self.view(model_id, &LlamaStatus::default()),
        })
    }

    /// Every known model's status, keyed by id.
    pub fn snapshot(&self) -> BTreeMap<String, LlamaStatus> {
        self.collect(|model_id, status| self.view(model_id, status))
    }

    pub async fn start(self: &Arc<Self>, model_id: &str) -> Result<LlamaStatus, SupervisorError> {
        self.run(Command::Start, model_id).await.result
    }

    pub async fn stop(self: &Arc<Self>, model_id: &str) -> Result<LlamaStatus, SupervisorError> {
        self.run(Command::Stop, model_id).await.result
    }

    /// Stop then start under a single command lock. A failed stop aborts
    /// before the start is attempted.
    pub async fn restart(self: &Arc<Self>, model_id: &str) -> Result<LlamaStatus, SupervisorError> {
        self.run(Command::Restart, model_id).await.result
    }

    /// Run `command` for `model_id` and report whether it changed the status.
    ///
    /// The before and after statuses are both read while the command lock is
    /// held, so a command that queued behind another one and turned out to
    /// be a no-op reports no change.
    pub async fn run(self: &Arc<Self>, command: Command, model_id: &str) -> CommandOutcome {
        if let Err(e) = validate_model_id(model_id) {
            return CommandOutcome {
                result: Err(e),
                changed: None,
            };
        }
        let entry = self.entry(model_id);
        let _command = entry.command_lock.lock().await;
        let before = fingerprint(&entry.lock_state().status);

        let result = match command {
            Command::Start => self.start_locked(model_id, &entry).await,
            Command::Stop => self.stop_locked(model_id, &entry).await,
            Command::Restart => match self.stop_locked(model_id, &entry).await {
                Ok(_) => self.start_locked(model_id, &entry).await,
                Err(e) => Err(e),
            },
        };

        let changed = {
            let state = entry.lock_state();
            (fingerprint(&state.status) != before).then(|| self.view(model_id, &state.status))
        };
        CommandOutcome { result, changed }
    }

    /// Stop every model that is currently running. Used on shutdown.
    pub async fn stop_all(self: &Arc<Self>) {
        let running: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(_, status)| status.status == ModelServerStatus::Ready)
            .map(|(model_id, _)| model_id)
            .collect();
        for model_id in running {
            match self.stop(&model_id).await {
                Ok(_) => sys_info!("[SUPERVISOR] Stopped '{}' for shutdown", model_id),
                Err(e) => sys_error!("[SUPERVISOR] Shutdown stop of '{}' failed: {}", model_id, e),
            }
        }
    }

    async fn start_locked(
        self: &Arc<Self>,
        model_id: &str,
        entry: &Arc<ModelEntry>,
    ) -> Result<LlamaStatus, SupervisorError> {
        self.refresh_catalog();

        let binary = worker_binary_path(&self.settings.workers_dir, model_id);
        if !is_readable_file(&binary) {
            sys_warn!("[SUPERVISOR] No worker binary for '{}' at {}", model_id, binary.display());
            return Err(SupervisorError::NotFound {
                model_id: model_id.to_string(),
                path: binary,
            });
        }

        let generation = {
            let mut state = entry.lock_state();
            let current = state.status.status;
            if matches!(current, ModelServerStatus::Ready | ModelServerStatus::Starting)
                || !state.status.transition(ModelServerStatus::Starting)
            {
                sys_debug!("[SUPERVISOR] start('{}') is a no-op from {}", model_id, current);
                return Ok(self.view(model_id, &state.status));
            }
            state.generation += 1;
            state.generation
        };
        self.persist().await;

        let spec = LaunchSpec {
            model_id: model_id.to_string(),
            binary: binary.clone(),
            args: self.worker_args(model_id),
            ready_pattern: self.settings.ready_pattern.clone(),
            stderr_tail_lines: self.settings.stderr_tail_lines,
        };
        let SpawnedProcess {
            handle,
            ready,
            exit,
        } = match self.launcher.launch(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = format!("failed to spawn {}: {e}", binary.display());
                self.fail_launch(model_id, entry, &reason).await;
                return Err(SupervisorError::LaunchFailed {
                    model_id: model_id.to_string(),
                    reason,
                });
            }
        };
        sys_info!(
            "[SUPERVISOR] Launched '{}' (pid {:?}, generation {})",
            model_id,
            handle.pid(),
            generation
        );

        entry.lock_state().process = Some(RunningProcess {
            handle: Arc::clone(&handle),
            exit: exit.clone(),
        });
        self.spawn_exit_observer(model_id, entry, generation, exit.clone());

        let mut exit = exit;
        let outcome = timeout(self.settings.launch_timeout, wait_until_ready(ready, &mut exit)).await;
        match outcome {
            Ok(ReadyOutcome::Ready) => {
                let view = {
                    let mut state = entry.lock_state();
                    if state.status.transition(ModelServerStatus::Ready) {
                        state.status.retries = 0;
                        state.status.started_at = Some(Utc::now());
                        state.status.last_error = None;
                    }
                    self.view(model_id, &state.status)
                };
                self.persist().await;
                sys_info!("[SUPERVISOR] '{}' is ready", model_id);
                Ok(view)
            }
            Ok(ReadyOutcome::Exited(info)) => {
                let reason = describe_failure(
                    handle.stderr_tail(),
                    &format!("exited before ready: {}", info.description),
                );
                self.fail_launch(model_id, entry, &reason).await;
                Err(SupervisorError::LaunchFailed {
                    model_id: model_id.to_string(),
                    reason,
                })
            }
            Err(_) => {
                let timeout_ms = u64::try_from(self.settings.launch_timeout.as_millis()).unwrap_or(u64::MAX);
                sys_warn!(
                    "[SUPERVISOR] '{}' not ready after {} ms, killing",
                    model_id,
                    timeout_ms
                );
                handle.kill();
                if timeout(self.settings.kill_wait, wait_for_exit(&mut exit)).await.is_err() {
                    sys_error!("[SUPERVISOR] '{}' still alive after kill", model_id);
                }
                let reason = describe_failure(
                    handle.stderr_tail(),
                    &format!("no readiness signal within {timeout_ms} ms"),
                );
                self.fail_launch(model_id, entry, &reason).await;
                Err(SupervisorError::LaunchTimeout {
                    model_id: model_id.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// `starting -> error` with the failure recorded, then persist.
    async fn fail_launch(&self, model_id: &str, entry: &ModelEntry, reason: &str) {
        {
            let mut state = entry.lock_state();
            state.process = None;
            if state.status.transition(ModelServerStatus::Error) {
                state.status.retries += 1;
                state.status.last_error = Some(reason.to_string());
            }
        }
        sys_error!("[SUPERVISOR] Launch of '{}' failed: {}", model_id, reason);
        self.persist().await;
    }

    async fn stop_locked(
        &self,
        model_id: &str,
        entry: &ModelEntry,
    ) -> Result<LlamaStatus, SupervisorError> {
        // Only `ready` can stop. Failed launches never leave a process behind,
        // and a `stopping` entry is waiting on its exit observer.
        let process = {
            let mut state = entry.lock_state();
            if state.status.status != ModelServerStatus::Ready {
                sys_debug!("[SUPERVISOR] stop('{}') is a no-op from {}", model_id, state.status.status);
                return Ok(self.view(model_id, &state.status));
            }
            state.status.transition(ModelServerStatus::Stopping);
            state.process.take()
        };

        self.persist().await;
        sys_info!("[SUPERVISOR] Stopping '{}'", model_id);

        let outcome = match &process {
            Some(process) => self.terminate_process(model_id, process).await,
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                let view = {
                    let mut state = entry.lock_state();
                    state.status.transition(ModelServerStatus::Initial);
                    state.status.started_at = None;
                    self.view(model_id, &state.status)
                };
                self.persist().await;
                sys_info!("[SUPERVISOR] '{}' stopped", model_id);
                Ok(view)
            }
            Err(reason) => {
                // Keep the handle so a late exit can still complete the stop.
                entry.lock_state().process = process;
                sys_error!("[SUPERVISOR] Stop of '{}' failed: {}", model_id, reason);
                Err(SupervisorError::StopFailed {
                    model_id: model_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Graceful terminate, bounded grace, forced kill, bounded reap.
    async fn terminate_process(&self, model_id: &str, process: &RunningProcess) -> Result<(), String> {
        let mut exit = process.exit.clone();

        process.handle.terminate();
        if timeout(self.settings.stop_grace, wait_for_exit(&mut exit)).await.is_ok() {
            return Ok(());
        }

        sys_warn!(
            "[SUPERVISOR] '{}' ignored terminate for {:?}, escalating to kill",
            model_id,
            self.settings.stop_grace
        );
        process.handle.kill();
        if timeout(self.settings.kill_wait, wait_for_exit(&mut exit)).await.is_ok() {
            return Ok(());
        }

        Err(format!(
            "process still alive {} ms after forced kill",
            self.settings.kill_wait.as_millis()
        ))
    }

    fn spawn_exit_observer(
        self: &Arc<Self>,
        model_id: &str,
        entry: &Arc<ModelEntry>,
        generation: u64,
        mut exit: watch::Receiver<Option<ExitInfo>>,
    ) {
        let supervisor = Arc::clone(self);
        let entry = Arc::clone(entry);
        let model_id = model_id.to_string();
        tokio::spawn(async move {
            let info = wait_for_exit(&mut exit)
                .await
                .unwrap_or_else(|| ExitInfo::unknown("process watcher closed"));
            let _command = entry.command_lock.lock().await;
            supervisor.handle_exit(&model_id, &entry, generation, info).await;
        });
    }

    /// Reconcile an exit notification against the entry's current state.
    ///
    /// Runs under the command lock, so the entry is never mid-launch here.
    async fn handle_exit(&self, model_id: &str, entry: &ModelEntry, generation: u64, info: ExitInfo) {
        let changed = {
            let mut state = entry.lock_state();
            if generation != state.generation {
                sys_debug!(
                    "[SUPERVISOR] Discarding stale exit for '{}' (generation {} < {})",
                    model_id,
                    generation,
                    state.generation
                );
                return;
            }
            let Some(process) = state.process.take() else {
                return;
            };

            match state.status.status {
                ModelServerStatus::Ready => {
                    state.status.transition(ModelServerStatus::Crashed);
                    state.status.retries += 1;
                    state.status.started_at = None;
                    let reason = describe_failure(process.handle.stderr_tail(), &info.description);
                    sys_error!("[SUPERVISOR] '{}' crashed: {}", model_id, reason);
                    state.status.last_error = Some(reason);
                    Some(self.view(model_id, &state.status))
                }
                ModelServerStatus::Stopping => {
                    state.status.transition(ModelServerStatus::Initial);
                    state.status.started_at = None;
                    sys_info!("[SUPERVISOR] '{}' exited after failed stop, now initial", model_id);
                    Some(self.view(model_id, &state.status))
                }
                _ => None,
            }
        };

        if let Some(status) = changed {
            self.persist().await;
            let _ = self.changes.send(StatusChange {
                model_id: model_id.to_string(),
                status,
            });
        }
    }

    fn entry(&self, model_id: &str) -> Arc<ModelEntry> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_id)
        {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            entries
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(ModelEntry::new(LlamaStatus::default()))),
        )
    }

    fn worker_args(&self, model_id: &str) -> Vec<String> {
        self.settings
            .worker_args
            .iter()
            .map(|arg| arg.replace("{model_id}", model_id))
            .collect()
    }

    /// Status as reported to callers: live uptime and the matching artifacts.
    fn view(&self, model_id: &str, status: &LlamaStatus) -> LlamaStatus {
        let mut view = status.clone();
        view.uptime = status.uptime_at(Utc::now());
        view.models = self
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|model| model.id == model_id)
            .cloned()
            .map(|mut model| {
                model.status = status.status;
                model
            })
            .collect();
        view
    }

    fn collect(&self, f: impl Fn(&str, &LlamaStatus) -> LlamaStatus) -> BTreeMap<String, LlamaStatus> {
        let entries: Vec<(String, Arc<ModelEntry>)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();
        entries
            .into_iter()
            .map(|(id, entry)| {
                let status = f(&id, &entry.lock_state().status);
                (id, status)
            })
            .collect()
    }

    fn persisted_state(&self) -> PersistedState {
        let models = self.collect(|_, status| {
            let mut stored = status.clone();
            stored.uptime = 0;
            stored.models.clear();
            stored
        });
        PersistedState {
            models,
            ..PersistedState::default()
        }
    }

    /// Write the whole registry on the blocking pool. Failures are logged;
    /// the in-memory state stays authoritative.
    ///
    /// The snapshot is taken after `persist_lock` is acquired and the lock is
    /// held until the write lands, so writes reach disk in snapshot order.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let state = self.persisted_state();
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.persist_state(&state)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => sys_error!("[SUPERVISOR] Failed to persist state: {}", e),
            Err(e) => sys_error!("[SUPERVISOR] Persist task failed: {}", e),
        }
    }
}

/// Wait for the readiness signal or an exit, whichever comes first.
async fn wait_until_ready(
    mut ready: oneshot::Receiver<()>,
    exit: &mut watch::Receiver<Option<ExitInfo>>,
) -> ReadyOutcome {
    let mut ready_open = true;
    loop {
        tokio::select! {
            biased;
            signal = &mut ready, if ready_open => match signal {
                Ok(()) => return ReadyOutcome::Ready,
                Err(_) => ready_open = false,
            },
            info = wait_for_exit(exit) => {
                return ReadyOutcome::Exited(
                    info.unwrap_or_else(|| ExitInfo::unknown("process watcher closed")),
                );
            }
        }
    }
}
