//! Worker process control.
//!
//! [`ProcessLauncher`] starts a worker and hands back a [`ProcessHandle`] plus
//! two signals: a one-shot readiness notification and a watch channel that
//! carries the exit once the child has been reaped. The supervisor only talks
//! to these traits, so tests can script crashes and hangs without real
//! processes.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{sys_debug, sys_info, sys_warn};

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub model_id: String,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub ready_pattern: Regex,
    pub stderr_tail_lines: usize,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub description: String,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self {
                    code: None,
                    description: format!("terminated by signal {signal}"),
                };
            }
        }
        Self {
            code: status.code(),
            description: status.to_string(),
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            description: reason.into(),
        }
    }
}

/// Control surface of a running worker.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;
    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&self);
    /// Force the process down.
    fn kill(&self);
    /// Most recent stderr lines, oldest first.
    fn stderr_tail(&self) -> Vec<String>;
}

pub struct SpawnedProcess {
    pub handle: Arc<dyn ProcessHandle>,
    /// Fires once when the readiness pattern is seen. Dropped unfired if the
    /// output streams close first.
    pub ready: oneshot::Receiver<()>,
    /// `Some` once the process has exited and been reaped.
    pub exit: watch::Receiver<Option<ExitInfo>>,
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess>;
}

/// Resolve once the exit watch carries a value.
///
/// Returns `None` if the sender went away without ever reporting an exit.
pub async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitInfo>>) -> Option<ExitInfo> {
    match exit.wait_for(Option::is_some).await {
        Ok(info) => info.clone(),
        Err(_) => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;
type ReadySender = Arc<Mutex<Option<oneshot::Sender<()>>>>;

/// Handle to a real child process. Signals are forwarded to the reaper task
/// that owns the `Child`.
#[derive(Debug)]
pub struct OsProcessHandle {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<Signal>,
    stderr: StderrTail,
}

impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self) {
        let _ = self.signals.send(Signal::Terminate);
    }

    fn kill(&self) {
        let _ = self.signals.send(Signal::Kill);
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Launches workers as OS child processes via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct OsProcessLauncher;

impl ProcessLauncher for OsProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        sys_info!(
            "[PROCESS_MGR] Spawning worker '{}': {} {}",
            spec.model_id,
            spec.binary.display(),
            spec.args.join(" ")
        );

        let mut child = Command::new(&spec.binary)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stderr: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready_tx: ReadySender = Arc::new(Mutex::new(Some(ready_tx)));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(watch_output(
                stdout,
                spec.ready_pattern.clone(),
                Arc::clone(&ready_tx),
                None,
            ));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(watch_output(
                err,
                spec.ready_pattern.clone(),
                Arc::clone(&ready_tx),
                Some((Arc::clone(&stderr), spec.stderr_tail_lines)),
            ));
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(reap_child(child, signal_rx, exit_tx, spec.model_id.clone()));

        Ok(SpawnedProcess {
            handle: Arc::new(OsProcessHandle {
                pid,
                signals: signal_tx,
                stderr,
            }),
            ready: ready_rx,
            exit: exit_rx,
        })
    }
}

/// Scan one output stream for the readiness pattern, optionally keeping a
/// bounded tail of its lines.
async fn watch_output<R>(
    stream: R,
    ready_pattern: Regex,
    ready_tx: ReadySender,
    tail: Option<(StderrTail, usize)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                sys_debug!("[PROCESS_MGR] Output stream closed: {}", e);
                break;
            }
        };

        if ready_pattern.is_match(&line) {
            let sender = ready_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(());
            }
        }

        if let Some((buffer, limit)) = &tail {
            let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push_back(line);
            while buffer.len() > *limit {
                buffer.pop_front();
            }
        }
    }
}

/// Own the child until it exits, applying signals as they arrive.
async fn reap_child(
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    model_id: String,
) {
    let pid = child.id();
    let result = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signals.recv() => match signal {
                Signal::Terminate => send_terminate(&mut child, pid),
                Signal::Kill => {
                    sys_warn!("[PROCESS_MGR] Killing worker '{}' (pid {:?})", model_id, pid);
                    if let Err(e) = child.start_kill() {
                        sys_debug!("[PROCESS_MGR] kill failed for '{}': {}", model_id, e);
                    }
                }
            },
        }
    };

    let info = match result {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => ExitInfo::unknown(format!("wait failed: {e}")),
    };
    sys_info!("[PROCESS_MGR] Worker '{}' exited: {}", model_id, info.description);
    exit_tx.send_replace(Some(info));
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    // SAFETY: plain signal delivery to a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        sys_debug!(
            "[PROCESS_MGR] SIGTERM to {} failed: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn shell_spec(script: &str) -> LaunchSpec {
        LaunchSpec {
            model_id: "shell-worker".to_string(),
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            ready_pattern: Regex::new("(?i)server is listening").unwrap(),
            stderr_tail_lines: 2,
        }
    }

    #[tokio::test]
    async fn test_ready_then_terminate() {
        let spawned = OsProcessLauncher
            .launch(&shell_spec("echo 'server is listening'; exec sleep 30"))
            .unwrap();
        assert!(spawned.handle.pid().is_some());

        timeout(Duration::from_secs(5), spawned.ready)
            .await
            .unwrap()
            .unwrap();

        spawned.handle.terminate();
        let mut exit = spawned.exit;
        let info = timeout(Duration::from_secs(5), wait_for_exit(&mut exit))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.code, None);
        assert!(info.description.contains("signal 15"), "{}", info.description);
    }

    #[tokio::test]
    async fn test_exit_keeps_bounded_stderr_tail() {
        let spawned = OsProcessLauncher
            .launch(&shell_spec("echo one >&2; echo two >&2; echo three >&2; exit 3"))
            .unwrap();

        let mut exit = spawned.exit;
        let info = timeout(Duration::from_secs(5), wait_for_exit(&mut exit))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.code, Some(3));

        // stderr reader may still be draining right after the reap.
        let mut tail = spawned.handle.stderr_tail();
        for _ in 0..50 {
            if tail.last().map(String::as_str) == Some("three") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            tail = spawned.handle.stderr_tail();
        }
        assert_eq!(tail, vec!["two".to_string(), "three".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_error_is_reported() {
        let mut spec = shell_spec("true");
        spec.binary = PathBuf::from("/nonexistent/llama-worker");
        assert!(OsProcessLauncher.launch(&spec).is_err());
    }
}
