//! Patch application with a dry run first.

use std::path::Path;

use tracing::{info, warn};

use crate::dashboard::Patch;
use crate::error::SourceError;
use crate::exec::{CommandRunner, CommandSpec};

const PATCH_ARGS: [&str; 3] = ["-p1", "--force", "--ignore-whitespace"];

/// Result of applying one patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The patch was applied.
    Applied,

    /// The patch reverses cleanly, so the tree already contains it.
    AlreadyPresent,

    /// The patch does not apply and was left out.
    Skipped,
}

/// Apply `patch` to the tree in `dir`.
///
/// A dry run guards the tree against partial application. When the dry run
/// fails, a reverse dry run tells an already applied patch apart from one
/// that no longer applies. The latter is skipped unless `strict` is set.
/// Only a real apply failing after a clean dry run is always an error.
pub async fn apply_patch(
    runner: &dyn CommandRunner,
    dir: &Path,
    patch: &Patch,
    strict: bool,
) -> Result<PatchOutcome, SourceError> {
    let patch_cmd = |extra: &[&str]| {
        CommandSpec::new("patch")
            .args(PATCH_ARGS)
            .args(extra.iter().copied())
            .dir(dir)
            .stdin(patch.diff.clone())
    };

    if let Err(dry_run) = runner.run(&patch_cmd(&["--dry-run"])).await {
        if runner
            .run(&patch_cmd(&["--reverse", "--dry-run"]))
            .await
            .is_ok()
        {
            info!(patch = %patch.title, "Patch already applied");
            return Ok(PatchOutcome::AlreadyPresent);
        }

        let output = dry_run.output().to_string();
        if strict {
            return Err(SourceError::PatchRejected {
                title: patch.title.clone(),
                output,
            });
        }
        warn!(patch = %patch.title, output = %output, "Patch does not apply, skipping");
        return Ok(PatchOutcome::Skipped);
    }

    runner
        .run(&patch_cmd(&[]))
        .await
        .map_err(|e| SourceError::PatchFailed {
            title: patch.title.clone(),
            output: e.output().to_string(),
        })?;
    info!(patch = %patch.title, "Patch applied");
    Ok(PatchOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ProcessRunner, ScriptedRunner};

    fn patch(title: &str, diff: &str) -> Patch {
        Patch {
            title: title.to_string(),
            diff: diff.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_clean_apply() {
        let runner = ScriptedRunner::new();
        let outcome = apply_patch(&runner, Path::new("/linux"), &patch("p", "d"), false)
            .await
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Applied);

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].args.contains(&"--dry-run".to_string()));
        assert_eq!(calls[1].args, PATCH_ARGS.map(String::from).to_vec());
        assert_eq!(calls[1].stdin.as_deref(), Some(b"d".as_slice()));
    }

    #[tokio::test]
    async fn test_reverse_dry_run_means_already_present() {
        let runner = ScriptedRunner::new();
        runner.fail("--dry-run", "Reversed (or previously applied) patch detected!");
        runner.respond("--reverse --dry-run", "");

        let outcome = apply_patch(&runner, Path::new("/linux"), &patch("p", "d"), true)
            .await
            .unwrap();
        assert_eq!(outcome, PatchOutcome::AlreadyPresent);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unapplicable_patch_skipped_or_rejected() {
        let runner = ScriptedRunner::new();
        runner.fail("--dry-run", "Hunk #1 FAILED");

        let outcome = apply_patch(&runner, Path::new("/linux"), &patch("p", "d"), false)
            .await
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Skipped);

        let err = apply_patch(&runner, Path::new("/linux"), &patch("p", "d"), true)
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "patch_rejected");
        assert!(err.to_string().contains("Hunk #1 FAILED"));
    }

    #[tokio::test]
    async fn test_real_apply_failure_is_error() {
        let runner = ScriptedRunner::new();
        runner.fail("patch -p1 --force --ignore-whitespace", "disk full");
        runner.respond("--dry-run", "");

        let err = apply_patch(&runner, Path::new("/linux"), &patch("p", "d"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::PatchFailed { .. }));
    }

    fn have_patch_tool() -> bool {
        std::process::Command::new("patch")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[tokio::test]
    async fn test_applying_twice_is_not_an_error() {
        assert!(have_patch_tool(), "`patch` must be installed to run this test");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.c");
        std::fs::write(&file, "int a;\nint x;\nint c;\n").unwrap();
        let diff = "--- a/file.c\n+++ b/file.c\n@@ -1,3 +1,3 @@\n int a;\n-int x;\n+int b;\n int c;\n";
        let runner = ProcessRunner::new();
        let p = patch("rename x", diff);

        let first = apply_patch(&runner, dir.path(), &p, true).await.unwrap();
        assert_eq!(first, PatchOutcome::Applied);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "int a;\nint b;\nint c;\n");

        let second = apply_patch(&runner, dir.path(), &p, true).await.unwrap();
        assert_eq!(second, PatchOutcome::AlreadyPresent);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "int a;\nint b;\nint c;\n");
    }

    #[tokio::test]
    async fn test_conflicting_patch_leaves_tree_alone() {
        assert!(have_patch_tool(), "`patch` must be installed to run this test");
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.c");
        std::fs::write(&file, "int a;\nint y;\nint c;\n").unwrap();
        let diff = "--- a/file.c\n+++ b/file.c\n@@ -1,3 +1,3 @@\n int a;\n-int x;\n+int b;\n int c;\n";
        let runner = ProcessRunner::new();

        let outcome = apply_patch(&runner, dir.path(), &patch("rename x", diff), false)
            .await
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Skipped);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "int a;\nint y;\nint c;\n");
    }
}
