//! Worker process supervision.
//!
//! The supervisor owns at most one worker process. Starting a worker spawns
//! a watcher task that owns the child, waits for it and hands the exit back
//! through a oneshot channel, which the update loop consumes in its
//! multi-way wait via [`ProcessSupervisor::wait_exit`].

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::layout::WorkspaceLayout;
use crate::manager_config::ManagerConfig;

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("worker started without a pid")]
    NoPid,

    #[error("failed to signal worker {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("exit notification for pid {0} with no such worker running")]
    SpuriousExit(u32),

    #[error("worker exit channel closed before the worker exited")]
    ExitChannelClosed,
}

impl SupervisorError {
    /// Returns true if supervision cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::SpuriousExit(_) | SupervisorError::ExitChannelClosed
        )
    }
}

/// Worker port shared with the status interface; 0 when no worker runs.
#[derive(Debug, Clone, Default)]
pub struct WorkerPort(Arc<AtomicU32>);

impl WorkerPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u16 {
        self.0.load(Ordering::Relaxed) as u16
    }

    fn set(&self, port: u16) {
        self.0.store(u32::from(port), Ordering::Relaxed);
    }
}

/// How to launch one worker instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub dir: PathBuf,
}

/// Produces the launch spec for a worker bound to a given port.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Write any configuration the worker needs and describe how to run it.
    async fn prepare(&self, port: u16) -> io::Result<WorkerSpec>;
}

/// Launches the fuzzing manager with a freshly generated config.
pub struct ManagerLauncher {
    config: Config,
    workspace: WorkspaceLayout,
}

impl ManagerLauncher {
    pub fn new(config: Config, workspace: WorkspaceLayout) -> Self {
        Self { config, workspace }
    }
}

#[async_trait]
impl WorkerLauncher for ManagerLauncher {
    async fn prepare(&self, port: u16) -> io::Result<WorkerSpec> {
        let manager_config = ManagerConfig::generate(&self.config, &self.workspace, port)?;
        let path = self.workspace.manager_config();
        manager_config.write(&path)?;
        Ok(WorkerSpec {
            program: self.workspace.manager_binary(),
            args: vec![format!(
                "-config={}",
                self.workspace.relative(&path)
            )],
            dir: self.workspace.root().to_path_buf(),
        })
    }
}

/// Exit report from the watcher task.
#[derive(Debug)]
pub struct WorkerExit {
    pub pid: u32,
    pub status: io::Result<ExitStatus>,
}

#[derive(Debug)]
struct RunningWorker {
    pid: u32,
    port: u16,
    started_at: Instant,
    stop_requested: bool,
    exit_rx: oneshot::Receiver<WorkerExit>,
}

/// Owns the lifecycle of the worker process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    worker: Option<RunningWorker>,
    port: WorkerPort,
    min_uptime: Duration,
    restart_not_before: Option<Instant>,
}

impl ProcessSupervisor {
    /// Create a supervisor publishing the worker port into `port`.
    pub fn new(port: WorkerPort, min_uptime: Duration) -> Self {
        Self {
            worker: None,
            port,
            min_uptime,
            restart_not_before: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Pid of the running worker.
    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().map(|w| w.pid)
    }

    /// Launch a worker. Only valid when none is running.
    pub fn start(&mut self, spec: &WorkerSpec, port: u16) -> Result<(), SupervisorError> {
        if let Some(worker) = &self.worker {
            warn!(pid = worker.pid, "Worker already running, not starting another");
            return Ok(());
        }

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.dir)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: spec.program.display().to_string(),
                source,
            })?;
        let pid = child.id().ok_or(SupervisorError::NoPid)?;

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(WorkerExit { pid, status });
        });

        info!(pid, port, program = %spec.program.display(), "Worker started");
        self.port.set(port);
        self.restart_not_before = None;
        self.worker = Some(RunningWorker {
            pid,
            port,
            started_at: Instant::now(),
            stop_requested: false,
            exit_rx,
        });
        Ok(())
    }

    /// Ask the worker to stop: interrupt first, kill on a repeated request.
    ///
    /// Returns false if no worker is running.
    pub fn request_stop(&mut self) -> Result<bool, SupervisorError> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(false);
        };
        let signal = if worker.stop_requested {
            Signal::SIGKILL
        } else {
            Signal::SIGINT
        };
        worker.stop_requested = true;
        info!(pid = worker.pid, signal = %signal, "Stopping worker");
        send_signal(worker.pid, signal)?;
        Ok(true)
    }

    /// Interrupt the worker without escalating, even if a stop is in flight.
    ///
    /// Returns false if no worker is running.
    pub fn interrupt(&mut self) -> Result<bool, SupervisorError> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(false);
        };
        worker.stop_requested = true;
        info!(pid = worker.pid, signal = %Signal::SIGINT, "Interrupting worker");
        send_signal(worker.pid, Signal::SIGINT)?;
        Ok(true)
    }

    /// Force-kill the worker.
    pub fn kill(&mut self) -> Result<(), SupervisorError> {
        if let Some(worker) = self.worker.as_mut() {
            worker.stop_requested = true;
            info!(pid = worker.pid, "Killing worker");
            send_signal(worker.pid, Signal::SIGKILL)?;
        }
        Ok(())
    }

    /// Wait for the worker to exit; pending forever when none is running.
    ///
    /// Cancel-safe. Pass the result to [`handle_exit`](Self::handle_exit).
    pub async fn wait_exit(&mut self) -> Result<WorkerExit, SupervisorError> {
        match self.worker.as_mut() {
            Some(worker) => (&mut worker.exit_rx)
                .await
                .map_err(|_| SupervisorError::ExitChannelClosed),
            None => std::future::pending().await,
        }
    }

    /// Record a worker exit and apply crash-loop protection.
    pub fn handle_exit(&mut self, exit: WorkerExit) -> Result<(), SupervisorError> {
        let worker = match self.worker.take() {
            Some(worker) if worker.pid == exit.pid => worker,
            other => {
                self.worker = other;
                return Err(SupervisorError::SpuriousExit(exit.pid));
            }
        };
        self.port.set(0);

        let uptime = worker.started_at.elapsed();
        match &exit.status {
            Ok(status) => info!(
                pid = worker.pid,
                port = worker.port,
                status = %status,
                uptime_secs = uptime.as_secs(),
                "Worker exited"
            ),
            Err(e) => warn!(pid = worker.pid, error = %e, "Failed to wait for worker"),
        }

        if !worker.stop_requested && uptime < self.min_uptime {
            let not_before = worker.started_at + self.min_uptime;
            warn!(
                pid = worker.pid,
                hold_off_secs = (self.min_uptime - uptime).as_secs(),
                "Worker exited too quickly, holding off restart"
            );
            self.restart_not_before = Some(not_before);
        }
        Ok(())
    }

    /// Time left before a restart is allowed, if any.
    pub fn restart_hold_off(&self) -> Option<Duration> {
        self.restart_not_before
            .map(|t| t.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), SupervisorError> {
    let raw = pid as i32;
    match kill(Pid::from_raw(raw), signal) {
        // Already exited, the watcher reports it.
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid: raw, source }),
    }
}
