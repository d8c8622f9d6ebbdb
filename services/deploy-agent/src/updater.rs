//! Update loop.
//!
//! Drives the deployment: poll every source, compare against what is
//! deployed, stop the worker, rebuild what changed, start a fresh worker.
//!
//! ```text
//!            timer / poll-now / worker exit
//! Sleeping ──────────────────────────────────> Polling
//!    ^                                            │
//!    │ error delay                                v
//!    ├──────────────────────────────────── EvaluatingChange
//!    │ idle delay (no change, worker up)          │
//!    │                                            v
//!    │ stop-poll delay, skip next poll    StoppingWorker (worker up)
//!    │                                            │ worker gone
//!    │ error delay                                v
//!    ├─────────────────────────────────────── Building
//!    │ crash-loop hold-off                        │
//!    │                                            v
//!    └─────────────────────────────────── StartingWorker
//!      healthy delay
//! ```
//!
//! Everything runs on one task. The worker exit and operator signals arrive
//! as events in the sleep step, so the loop never busy-polls.

use std::sync::Arc;
use std::time::Duration;

use fuzzdeploy_reconcile::{ReconcileError, SourceStates};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::manager_config::choose_unused_port;
use crate::process::{ProcessSupervisor, SupervisorError, WorkerLauncher};
use crate::signals::{graceful_shutdown, ControlEvent};
use crate::sources::{ChangeSource, SourceContext};

/// Fatal update loop errors.
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("supervisor: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("state: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Update loop timings.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Delay after a failed poll, rebuild or start.
    pub error_delay: Duration,

    /// Delay when nothing changed.
    pub idle_delay: Duration,

    /// Delay between stop requests to the old worker.
    pub stop_poll_delay: Duration,

    /// Delay after a successful start; bounds staleness.
    pub healthy_delay: Duration,

    /// Minimum worker uptime before an unrequested exit allows a restart.
    pub min_uptime: Duration,

    /// Time a stopping worker gets on shutdown before it is killed.
    pub shutdown_timeout: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            error_delay: Duration::from_secs(15 * 60),
            idle_delay: Duration::from_secs(60 * 60),
            stop_poll_delay: Duration::from_secs(60),
            healthy_delay: Duration::from_secs(6 * 60 * 60),
            min_uptime: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// Loop states, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Sleeping,
    Polling,
    EvaluatingChange,
    StoppingWorker,
    Building,
    StartingWorker,
}

enum Wake {
    Continue,
    Shutdown,
}

/// The update loop.
pub struct Updater {
    sources: Vec<Box<dyn ChangeSource>>,
    states: SourceStates,
    ctx: SourceContext,
    supervisor: ProcessSupervisor,
    launcher: Arc<dyn WorkerLauncher>,
    events: mpsc::Receiver<ControlEvent>,
    config: UpdaterConfig,
    already_polled: bool,
    state: LoopState,
}

impl Updater {
    /// Create a loop over `sources`, polled and rebuilt in the given order.
    pub fn new(
        sources: Vec<Box<dyn ChangeSource>>,
        supervisor: ProcessSupervisor,
        launcher: Arc<dyn WorkerLauncher>,
        events: mpsc::Receiver<ControlEvent>,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            sources,
            states: SourceStates::new(),
            ctx: SourceContext::default(),
            supervisor,
            launcher,
            events,
            config,
            already_polled: false,
            state: LoopState::Sleeping,
        }
    }

    fn enter(&mut self, state: LoopState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Update loop transition");
            self.state = state;
        }
    }

    /// Run until shutdown. Returns an error only for fatal conditions.
    pub async fn run(mut self) -> Result<(), UpdaterError> {
        info!(
            sources = ?self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Update loop started"
        );

        let mut delay = Duration::ZERO;
        loop {
            if !delay.is_zero() {
                if let Wake::Shutdown = self.sleep(delay).await? {
                    info!("Shutdown requested");
                    graceful_shutdown(
                        &mut self.supervisor,
                        &mut self.events,
                        self.config.shutdown_timeout,
                    )
                    .await?;
                    info!("Update loop stopped");
                    return Ok(());
                }
            }
            delay = self.run_cycle().await?;
        }
    }

    async fn sleep(&mut self, delay: Duration) -> Result<Wake, UpdaterError> {
        self.enter(LoopState::Sleeping);
        info!(delay_secs = delay.as_secs_f64(), "Sleeping");

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(Wake::Continue),
            exit = self.supervisor.wait_exit() => {
                self.supervisor.handle_exit(exit?)?;
                Ok(Wake::Continue)
            }
            event = self.events.recv() => match event {
                Some(ControlEvent::PollNow) => {
                    info!("Poll requested");
                    Ok(Wake::Continue)
                }
                Some(ControlEvent::Shutdown) | None => Ok(Wake::Shutdown),
            },
        }
    }

    /// One pass through the state machine; returns the next sleep.
    async fn run_cycle(&mut self) -> Result<Duration, UpdaterError> {
        if !self.already_polled {
            self.enter(LoopState::Polling);
            for source in &mut self.sources {
                match source.identify(&mut self.ctx).await {
                    Ok(token) => {
                        debug!(source = %source.name(), token = %token, "Polled");
                        self.states.observe(source.name(), token);
                    }
                    Err(e) => {
                        warn!(
                            source = %source.name(),
                            reason = e.reason_code(),
                            error = %e,
                            "Failed to poll"
                        );
                        return Ok(self.config.error_delay);
                    }
                }
            }
        }

        self.enter(LoopState::EvaluatingChange);
        let changes = self
            .states
            .changes(self.sources.iter().map(|s| s.name()));
        for change in &changes {
            info!(source = %change.source, from = %change.from, to = %change.to, "Source changed");
        }
        let running = self.supervisor.is_running();
        if changes.is_empty() && running {
            info!("No changes");
            return Ok(self.config.idle_delay);
        }

        if running {
            self.enter(LoopState::StoppingWorker);
            if let Err(e) = self.supervisor.request_stop() {
                if e.is_fatal() {
                    return Err(e.into());
                }
                warn!(error = %e, "Failed to signal worker");
            }
            self.already_polled = true;
            return Ok(self.config.stop_poll_delay);
        }
        self.already_polled = false;

        self.enter(LoopState::Building);
        for source in &mut self.sources {
            let name = source.name().to_string();
            if !self.states.is_changed(&name) {
                continue;
            }
            info!(source = %name, "Rebuilding");
            if let Err(e) = source.rebuild(&mut self.ctx).await {
                warn!(
                    source = %name,
                    reason = e.reason_code(),
                    error = %e,
                    "Rebuild failed"
                );
                return Ok(self.config.error_delay);
            }
            self.states.commit(&name)?;
        }

        if let Some(hold_off) = self.supervisor.restart_hold_off() {
            info!(hold_off_secs = hold_off.as_secs(), "Restart held off after a quick exit");
            return Ok(hold_off);
        }

        self.enter(LoopState::StartingWorker);
        let port = match choose_unused_port() {
            Ok(port) => port,
            Err(e) => {
                warn!(error = %e, "Failed to choose a worker port");
                return Ok(self.config.error_delay);
            }
        };
        let spec = match self.launcher.prepare(port).await {
            Ok(spec) => spec,
            Err(e) => {
                warn!(error = %e, "Failed to prepare worker");
                return Ok(self.config.error_delay);
            }
        };
        if let Err(e) = self.supervisor.start(&spec, port) {
            error!(error = %e, "Failed to start worker");
            return Ok(self.config.error_delay);
        }
        Ok(self.config.healthy_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timings() {
        let config = UpdaterConfig::default();
        assert_eq!(config.error_delay, Duration::from_secs(900));
        assert_eq!(config.idle_delay, Duration::from_secs(3600));
        assert_eq!(config.stop_poll_delay, Duration::from_secs(60));
        assert_eq!(config.healthy_delay, Duration::from_secs(21600));
        assert_eq!(config.min_uptime, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }
}
