//! Operator signal handling.
//!
//! `SIGUSR1` asks for an immediate poll. `SIGINT` and `SIGTERM` request a
//! shutdown; while a worker is still stopping, another one escalates to a
//! kill. Signals are forwarded as [`ControlEvent`]s so the update loop can
//! wait on them alongside its timer and the worker exit.

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::process::{ProcessSupervisor, SupervisorError};

/// Loop control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Poll all sources now.
    PollNow,

    /// Stop the worker and exit.
    Shutdown,
}

/// Forwards OS signals into a control channel.
pub struct SignalController;

impl SignalController {
    /// Install signal handlers and spawn the forwarding task.
    pub fn spawn(events: mpsc::Sender<ControlEvent>) -> std::io::Result<JoinHandle<()>> {
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut term = signal(SignalKind::terminate())?;

        Ok(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(()) = usr1.recv() => {
                        info!("SIGUSR1 received");
                        ControlEvent::PollNow
                    }
                    Some(()) = int.recv() => {
                        info!("SIGINT received");
                        ControlEvent::Shutdown
                    }
                    Some(()) = term.recv() => {
                        info!("SIGTERM received");
                        ControlEvent::Shutdown
                    }
                    else => break,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }))
    }
}

/// Stop the worker within `timeout`, escalating to a kill.
///
/// Sends an interrupt, also when a stop is already in flight, then waits for the first of: the worker exiting,
/// another shutdown request, or the timeout. The latter two kill the worker.
/// Returns once the worker is gone.
pub async fn graceful_shutdown(
    supervisor: &mut ProcessSupervisor,
    events: &mut mpsc::Receiver<ControlEvent>,
    timeout: Duration,
) -> Result<(), SupervisorError> {
    if !supervisor.is_running() {
        return Ok(());
    }

    info!(pid = ?supervisor.pid(), "Shutting down worker");
    supervisor.interrupt()?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut events_open = true;
    loop {
        tokio::select! {
            exit = supervisor.wait_exit() => {
                return supervisor.handle_exit(exit?);
            }
            event = events.recv(), if events_open => match event {
                Some(ControlEvent::Shutdown) => {
                    warn!("Repeated shutdown request, killing worker");
                    break;
                }
                Some(ControlEvent::PollNow) => {}
                None => events_open = false,
            },
            _ = &mut deadline => {
                warn!(timeout_secs = timeout.as_secs(), "Worker did not stop in time, killing");
                break;
            }
        }
    }

    supervisor.kill()?;
    let exit = supervisor.wait_exit().await?;
    supervisor.handle_exit(exit)
}
