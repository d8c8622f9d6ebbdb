//! Change sources.
//!
//! A change source reports an identity token for the current upstream state
//! of one input and knows how to rebuild local artifacts from it:
//!
//! - [`SyzkallerSource`]: the manager checkout; token is the head commit.
//! - [`PatchSetSource`]: dashboard patch set; token is the patch-set hash.
//! - [`KernelSource`]: local kernel and image build; token is the kernel head
//!   composed with the patch-set hash.
//! - [`ImageSource`]: prebuilt image archive; token is its modification time.
//!
//! Sources run strictly one at a time on the update loop. The only state
//! shared between them is the [`SourceContext`], which the loop threads
//! through every call in source order.

mod image;
mod kernel;
mod mock;
mod patch;
mod patches;
mod syzkaller;

use async_trait::async_trait;
use fuzzdeploy_reconcile::Token;

use crate::dashboard::Patch;
use crate::error::SourceError;

pub use image::ImageSource;
pub use kernel::KernelSource;
pub use mock::{MockSource, SourceLog};
pub use patch::{apply_patch, PatchOutcome};
pub use patches::PatchSetSource;
pub use syzkaller::SyzkallerSource;

/// Values produced by one source and consumed by a later one.
#[derive(Debug, Clone, Default)]
pub struct SourceContext {
    /// Patch-set hash from the most recent dashboard poll.
    pub patch_hash: String,

    /// Patches fetched by the most recent dashboard rebuild.
    pub patches: Vec<Patch>,
}

/// A polled input of the deployment.
#[async_trait]
pub trait ChangeSource: Send {
    /// Unique source name, used as the state key and in logs.
    fn name(&self) -> &str;

    /// Read-only check of the upstream state.
    async fn identify(&mut self, ctx: &mut SourceContext) -> Result<Token, SourceError>;

    /// Bring local artifacts up to the last identified state. Idempotent.
    async fn rebuild(&mut self, ctx: &mut SourceContext) -> Result<(), SourceError>;
}
