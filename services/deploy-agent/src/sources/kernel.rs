//! Local kernel and image build.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fuzzdeploy_reconcile::Token;
use tracing::info;

use super::patch::{apply_patch, PatchOutcome};
use super::{ChangeSource, SourceContext};
use crate::cloud::ImagePublisher;
use crate::config::Config;
use crate::error::SourceError;
use crate::exec::{CommandRunner, CommandSpec};
use crate::git;
use crate::layout::WorkspaceLayout;

/// Config fragment merged into the defconfig when none is configured.
const DEFAULT_KERNEL_CONFIG: &str = "\
CONFIG_KCOV=y
CONFIG_KCOV_INSTRUMENT_ALL=y
CONFIG_DEBUG_INFO=y
CONFIG_KASAN=y
CONFIG_KASAN_INLINE=y
CONFIG_FAULT_INJECTION=y
CONFIG_FAILSLAB=y
CONFIG_FAIL_PAGE_ALLOC=y
CONFIG_FAULT_INJECTION_DEBUG_FS=y
CONFIG_LOCKDEP=y
CONFIG_PROVE_LOCKING=y
CONFIG_DEBUG_ATOMIC_SLEEP=y
CONFIG_CONFIGFS_FS=y
CONFIG_SECURITYFS=y
CONFIG_USER_NS=y
CONFIG_NET_NS=y
CONFIG_TUN=y
";

/// Builds the kernel from a branch plus the dashboard patch set, packs it
/// into a disk image and registers that image.
pub struct KernelSource {
    runner: Arc<dyn CommandRunner>,
    publisher: ImagePublisher,
    workspace: WorkspaceLayout,
    repo: String,
    branch: String,
    compiler: String,
    userspace: PathBuf,
    kernel_config: Option<PathBuf>,
    strict_patches: bool,
    jobs: usize,
}

impl KernelSource {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        publisher: ImagePublisher,
        workspace: WorkspaceLayout,
        cfg: &Config,
    ) -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 2;
        Self {
            runner,
            publisher,
            userspace: workspace.resolve(&cfg.linux_userspace),
            kernel_config: (!cfg.linux_config.is_empty())
                .then(|| workspace.resolve(&cfg.linux_config)),
            workspace,
            repo: cfg.linux_git.clone(),
            branch: cfg.linux_branch.clone(),
            compiler: cfg.linux_compiler.clone(),
            strict_patches: cfg.strict_patches,
            jobs,
        }
    }

    async fn make(&self, dir: &Path, args: &[&str]) -> Result<(), SourceError> {
        self.runner
            .run(&CommandSpec::new("make").args(args.iter().copied()).dir(dir))
            .await?;
        Ok(())
    }

    async fn build_kernel(&self, dir: &Path) -> Result<(), SourceError> {
        remove_if_exists(&dir.join(".config")).await?;
        self.make(dir, &["defconfig"]).await?;
        self.make(dir, &["kvmconfig"]).await?;

        let fragment = match &self.kernel_config {
            Some(path) => path.clone(),
            None => {
                let path = dir.join("syz.config");
                tokio::fs::write(&path, DEFAULT_KERNEL_CONFIG).await?;
                path
            }
        };
        self.runner
            .run(
                &CommandSpec::new("scripts/kconfig/merge_config.sh")
                    .args(["-n", ".config"])
                    .arg(fragment.display().to_string())
                    .dir(dir),
            )
            .await?;

        self.make(dir, &["olddefconfig"]).await?;
        let jobs = self.jobs.to_string();
        let cc = format!("CC={}", self.compiler);
        self.make(dir, &["-j", &jobs, &cc]).await
    }

    /// Move build outputs into the artifact directory.
    async fn install_artifacts(&self, revision: &str) -> Result<(), SourceError> {
        let build = self.workspace.build_dir();
        let artifacts = self.workspace.artifacts();

        remove_if_exists(&build.join("disk.raw")).await?;
        remove_if_exists(&build.join("image.tar.gz")).await?;
        tokio::fs::create_dir_all(artifacts.obj_dir()).await?;
        tokio::fs::write(artifacts.tag_path(), revision).await?;
        tokio::fs::rename(build.join("key"), artifacts.key_path()).await?;
        tokio::fs::rename(
            self.workspace.linux_dir().join("vmlinux"),
            artifacts.vmlinux_path(),
        )
        .await?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl ChangeSource for KernelSource {
    fn name(&self) -> &str {
        "kernel"
    }

    async fn identify(&mut self, ctx: &mut SourceContext) -> Result<Token, SourceError> {
        let head = git::poll(
            self.runner.as_ref(),
            &self.workspace.linux_dir(),
            &self.repo,
            &self.branch,
        )
        .await?;
        Ok(Token::composite(&head, &ctx.patch_hash))
    }

    async fn rebuild(&mut self, ctx: &mut SourceContext) -> Result<(), SourceError> {
        let linux = self.workspace.linux_dir();
        let revision = git::head_commit(self.runner.as_ref(), &linux).await?;

        let mut applied = 0;
        for patch in &ctx.patches {
            let outcome =
                apply_patch(self.runner.as_ref(), &linux, patch, self.strict_patches).await?;
            if outcome == PatchOutcome::Applied {
                applied += 1;
            }
        }

        info!(revision = %revision, patches = applied, "Building kernel");
        self.build_kernel(&linux).await?;

        info!(revision = %revision, "Building image");
        self.runner
            .run(
                &CommandSpec::new(self.workspace.image_script().display().to_string())
                    .arg(self.userspace.display().to_string())
                    .arg(linux.join("arch/x86/boot/bzImage").display().to_string())
                    .arg(linux.join("vmlinux").display().to_string())
                    .arg(revision.as_str())
                    .dir(self.workspace.build_dir()),
            )
            .await?;

        self.install_artifacts(&revision).await?;
        self.publisher
            .publish(&self.workspace.build_dir().join("disk.tar.gz"))
            .await?;
        Ok(())
    }
}
