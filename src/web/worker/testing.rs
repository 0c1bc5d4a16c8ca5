//! Scripted process launcher for supervisor and bridge tests.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};

use super::process_manager::{ExitInfo, LaunchSpec, ProcessHandle, ProcessLauncher, SpawnedProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    ReadyImmediately,
    NeverReady,
    ExitBeforeReady,
    SpawnError,
}

static NEXT_PID: AtomicU32 = AtomicU32::new(10_000);

#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    args: Vec<String>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    // Held so a never-ready worker doesn't look like a closed pipe.
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    stderr: Vec<String>,
    ignore_terminate: bool,
    ignore_kill: bool,
    terminations: AtomicUsize,
    kills: AtomicUsize,
}

impl FakeProcess {
    /// Report an exit with `code`, as if the worker died on its own.
    pub fn crash(&self, code: i32) {
        self.exit_tx.send_replace(Some(ExitInfo {
            code: Some(code),
            description: format!("exit status: {code}"),
        }));
    }

    /// Deliver the readiness signal a `NeverReady` launch was holding back.
    pub fn become_ready(&self) {
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub fn args(&self) -> Vec<String> {
        self.args.clone()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    fn signalled(&self, signal: i32) {
        self.exit_tx.send_replace(Some(ExitInfo {
            code: None,
            description: format!("terminated by signal {signal}"),
        }));
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate {
            self.signalled(15);
        }
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_kill {
            self.signalled(9);
        }
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.stderr.clone()
    }
}

#[derive(Debug)]
pub struct ScriptedLauncher {
    script: Mutex<Script>,
    stderr: Vec<String>,
    ignore_terminate: bool,
    ignore_kill: bool,
    launched: Mutex<Vec<Arc<FakeProcess>>>,
}

impl ScriptedLauncher {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            stderr: Vec::new(),
            ignore_terminate: false,
            ignore_kill: false,
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stderr(mut self, lines: &[&str]) -> Self {
        self.stderr = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    pub fn ignoring_kill(mut self) -> Self {
        self.ignore_kill = true;
        self
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn launches(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Arc<FakeProcess>> {
        self.launched.lock().unwrap().last().cloned()
    }

    pub fn all(&self) -> Vec<Arc<FakeProcess>> {
        self.launched.lock().unwrap().clone()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        let script = *self.script.lock().unwrap();
        if script == Script::SpawnError {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "scripted spawn failure",
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready_tx = match script {
            Script::ReadyImmediately => {
                let _ = ready_tx.send(());
                None
            }
            Script::NeverReady => Some(ready_tx),
            _ => None,
        };

        let fake = Arc::new(FakeProcess {
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            args: spec.args.clone(),
            exit_tx,
            ready_tx: Mutex::new(ready_tx),
            stderr: self.stderr.clone(),
            ignore_terminate: self.ignore_terminate,
            ignore_kill: self.ignore_kill,
            terminations: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
        });
        if script == Script::ExitBeforeReady {
            fake.crash(1);
        }
        self.launched.lock().unwrap().push(Arc::clone(&fake));

        Ok(SpawnedProcess {
            handle: fake,
            ready: ready_rx,
            exit: exit_rx,
        })
    }
}
