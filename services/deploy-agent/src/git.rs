//! Git checkout helpers built on [`CommandRunner`].

use std::path::Path;

use tracing::warn;

use crate::exec::{CommandError, CommandRunner, CommandSpec};

/// Return the commit hash of HEAD in `dir`.
pub async fn head_commit(runner: &dyn CommandRunner, dir: &Path) -> Result<String, CommandError> {
    let output = runner
        .run(
            &CommandSpec::new("git")
                .args(["log", "--pretty=format:%H", "-n", "1"])
                .dir(dir),
        )
        .await?;
    Ok(String::from_utf8_lossy(&output).trim().to_string())
}

/// Bring the checkout in `dir` to the tip of `repo`/`branch` and return HEAD.
///
/// Local modifications (e.g. previously applied patches) are discarded. The
/// checkout is recreated if it is missing or tracks a different remote.
pub async fn poll(
    runner: &dyn CommandRunner,
    dir: &Path,
    repo: &str,
    branch: &str,
) -> Result<String, CommandError> {
    let origin = if dir.join(".git").exists() {
        if let Err(e) = runner
            .run(&CommandSpec::new("git").args(["reset", "--hard"]).dir(dir))
            .await
        {
            warn!(dir = %dir.display(), error = %e, "Failed to reset checkout");
        }
        runner
            .run(
                &CommandSpec::new("git")
                    .args(["remote", "get-url", "origin"])
                    .dir(dir),
            )
            .await
            .ok()
            .map(|out| String::from_utf8_lossy(&out).trim().to_string())
    } else {
        None
    };

    if origin.as_deref() != Some(repo) {
        clone(runner, dir, repo, branch).await?;
    } else {
        runner
            .run(
                &CommandSpec::new("git")
                    .args(["fetch", "--no-tags", "--depth=1", "origin", branch])
                    .dir(dir),
            )
            .await?;
        runner
            .run(
                &CommandSpec::new("git")
                    .args(["checkout", "-f", "FETCH_HEAD"])
                    .dir(dir),
            )
            .await?;
    }

    head_commit(runner, dir).await
}

async fn clone(
    runner: &dyn CommandRunner,
    dir: &Path,
    repo: &str,
    branch: &str,
) -> Result<(), CommandError> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(CommandError::Io {
                context: format!("failed to remove {}", dir.display()),
                source: e,
            });
        }
        _ => {}
    }
    if let Some(parent) = dir.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| CommandError::Io {
                context: format!("failed to create {}", parent.display()),
                source,
            })?;
    }
    runner
        .run(&CommandSpec::new("git").args([
            "clone",
            "--single-branch",
            "--depth=1",
            "--branch",
            branch,
            repo,
            &dir.display().to_string(),
        ]))
        .await?;
    Ok(())
}
