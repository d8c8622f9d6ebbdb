//! Error types for change sources.

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::cloud::CloudError;
use crate::dashboard::DashboardError;
use crate::exec::CommandError;

/// Change source errors with standardized reason codes.
///
/// Any of these aborts the current update cycle; the loop retries after the
/// error delay.
#[derive(Debug, Error)]
pub enum SourceError {
    /// An external command exited non-zero or could not be run.
    #[error("{0}")]
    Command(#[from] CommandError),

    /// Image archive was corrupt or incomplete.
    #[error("archive_invalid: {0}")]
    Archive(#[from] ArchiveError),

    /// Blob storage or image service call failed.
    #[error("cloud_error: {0}")]
    Cloud(#[from] CloudError),

    /// Dashboard query failed.
    #[error("dashboard_error: {0}")]
    Dashboard(#[from] DashboardError),

    /// Patch passed its dry run but the real apply failed.
    #[error("patch_failed: {title}: {output}")]
    PatchFailed { title: String, output: String },

    /// Patch neither applies nor is already present, with strict patching.
    #[error("patch_rejected: {title}: {output}")]
    PatchRejected { title: String, output: String },

    /// Blocking task panicked or was cancelled.
    #[error("task_failed: {0}")]
    Task(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SourceError::Command(_) => "command_failed",
            SourceError::Archive(_) => "archive_invalid",
            SourceError::Cloud(_) => "cloud_error",
            SourceError::Dashboard(_) => "dashboard_error",
            SourceError::PatchFailed { .. } => "patch_failed",
            SourceError::PatchRejected { .. } => "patch_rejected",
            SourceError::Task(_) => "task_failed",
            SourceError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = SourceError::from(ArchiveError::MissingMember("tag".to_string()));
        assert_eq!(err.reason_code(), "archive_invalid");
        assert!(err.to_string().contains("'tag'"));

        let err = SourceError::PatchFailed {
            title: "fix".to_string(),
            output: "hunk FAILED".to_string(),
        };
        assert_eq!(err.reason_code(), "patch_failed");
        assert_eq!(err.to_string(), "patch_failed: fix: hunk FAILED");
    }
}
