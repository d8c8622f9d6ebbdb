//! fuzzdeploy Deploy Agent Library
//!
//! The deploy agent keeps a long-running fuzzing manager on fresh inputs. It
//! polls the manager sources, the kernel (or a prebuilt image) and an
//! optional dashboard patch set, and when any of them changes it stops the
//! manager, rebuilds what changed and starts a new manager.
//!
//! ## Architecture
//!
//! ```text
//! SignalController ──┐
//! timer ─────────────┼──> Updater ──> ChangeSource (syzkaller, dashboard,
//! worker exit ───────┘       │                     kernel | GCS image)
//!                            └──────> ProcessSupervisor ──> manager
//! ```
//!
//! ## Modules
//!
//! - `updater`: the update loop state machine
//! - `sources`: change sources and patch application
//! - `process`: worker supervision with crash-loop protection
//! - `signals`: operator signal handling and bounded shutdown
//! - `cloud`, `dashboard`: external collaborators
//! - `status`: read-only status HTTP interface

pub mod archive;
pub mod artifacts;
pub mod cloud;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod exec;
pub mod git;
pub mod layout;
pub mod logging;
pub mod manager_config;
pub mod process;
pub mod signals;
pub mod sources;
pub mod status;
pub mod updater;

// Re-export commonly used types
pub use config::Config;
pub use error::SourceError;
pub use process::{ManagerLauncher, ProcessSupervisor, WorkerLauncher, WorkerPort, WorkerSpec};
pub use signals::{ControlEvent, SignalController};
pub use sources::{ChangeSource, MockSource, SourceContext};
pub use updater::{Updater, UpdaterConfig, UpdaterError};
