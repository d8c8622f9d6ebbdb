//! Manager checkout source.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fuzzdeploy_reconcile::Token;
use tracing::info;

use super::{ChangeSource, SourceContext};
use crate::error::SourceError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::git;
use crate::layout::WorkspaceLayout;

/// Go import path fetched to update the checkout.
const MANAGER_PACKAGE: &str = "github.com/google/syzkaller/syz-manager";

/// Tracks the manager sources inside GOPATH and rebuilds the binaries.
pub struct SyzkallerSource {
    runner: Arc<dyn CommandRunner>,
    checkout: PathBuf,
}

impl SyzkallerSource {
    pub fn new(runner: Arc<dyn CommandRunner>, workspace: &WorkspaceLayout) -> Self {
        Self {
            runner,
            checkout: workspace.syzkaller_dir(),
        }
    }
}

#[async_trait]
impl ChangeSource for SyzkallerSource {
    fn name(&self) -> &str {
        "syzkaller"
    }

    async fn identify(&mut self, _ctx: &mut SourceContext) -> Result<Token, SourceError> {
        self.runner
            .run(&CommandSpec::new("go").args(["get", "-u", "-d", MANAGER_PACKAGE]))
            .await?;
        let head = git::head_commit(self.runner.as_ref(), &self.checkout).await?;
        Ok(Token::new(head))
    }

    async fn rebuild(&mut self, _ctx: &mut SourceContext) -> Result<(), SourceError> {
        self.runner
            .run(&CommandSpec::new("make").dir(&self.checkout))
            .await?;
        info!(dir = %self.checkout.display(), "Manager binaries built");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ScriptedRunner;

    #[tokio::test]
    async fn test_identify_updates_then_reads_head() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond("git log", "0123abcd");
        let workspace = WorkspaceLayout::new("/srv/ci");
        let mut source = SyzkallerSource::new(runner.clone(), &workspace);

        let token = source.identify(&mut SourceContext::default()).await.unwrap();
        assert_eq!(token.as_str(), "0123abcd");

        let calls = runner.calls();
        assert_eq!(calls[0].to_string(), format!("go get -u -d {MANAGER_PACKAGE}"));
        assert_eq!(calls[1].dir.as_deref(), Some(workspace.syzkaller_dir().as_path()));
    }

    #[tokio::test]
    async fn test_identify_propagates_fetch_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("go get", "network unreachable");
        let mut source = SyzkallerSource::new(runner.clone(), &WorkspaceLayout::new("/srv/ci"));

        let err = source
            .identify(&mut SourceContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "command_failed");
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_runs_make_in_checkout() {
        let runner = Arc::new(ScriptedRunner::new());
        let workspace = WorkspaceLayout::new("/srv/ci");
        let mut source = SyzkallerSource::new(runner.clone(), &workspace);

        source.rebuild(&mut SourceContext::default()).await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "make");
        assert_eq!(calls[0].dir, Some(workspace.syzkaller_dir()));
    }
}
