//! Dashboard patch-set source.

use std::sync::Arc;

use async_trait::async_trait;
use fuzzdeploy_reconcile::Token;
use tracing::info;

use super::{ChangeSource, SourceContext};
use crate::dashboard::PatchDashboard;
use crate::error::SourceError;

/// Polls the dashboard for the current patch set.
///
/// `identify` publishes the patch-set hash into the context for the kernel
/// source's composite token; `rebuild` fetches the patches themselves.
pub struct PatchSetSource {
    dashboard: Arc<dyn PatchDashboard>,
}

impl PatchSetSource {
    pub fn new(dashboard: Arc<dyn PatchDashboard>) -> Self {
        Self { dashboard }
    }
}

#[async_trait]
impl ChangeSource for PatchSetSource {
    fn name(&self) -> &str {
        "dashboard"
    }

    async fn identify(&mut self, ctx: &mut SourceContext) -> Result<Token, SourceError> {
        let hash = self.dashboard.poll_patches().await?;
        ctx.patch_hash = hash.clone();
        Ok(Token::new(hash))
    }

    async fn rebuild(&mut self, ctx: &mut SourceContext) -> Result<(), SourceError> {
        ctx.patches = self.dashboard.get_patches().await?;
        info!(count = ctx.patches.len(), hash = %ctx.patch_hash, "Fetched patch set");
        Ok(())
    }
}
