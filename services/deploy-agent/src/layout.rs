//! Fixed locations inside the agent's working directory.

use std::path::{Path, PathBuf};

use crate::artifacts::ArtifactLayout;

/// Import path of the manager sources inside GOPATH.
const SYZKALLER_IMPORT_PATH: &str = "src/github.com/google/syzkaller";

/// Paths relative to the agent's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    /// Layout rooted at the agent's working directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn gopath(&self) -> PathBuf {
        self.root.join("gopath")
    }

    /// Checkout of the manager sources.
    pub fn syzkaller_dir(&self) -> PathBuf {
        self.gopath().join(SYZKALLER_IMPORT_PATH)
    }

    /// Manager binary built from the checkout.
    pub fn manager_binary(&self) -> PathBuf {
        self.syzkaller_dir().join("bin").join("syz-manager")
    }

    /// Image creation script shipped with the manager sources.
    pub fn image_script(&self) -> PathBuf {
        self.syzkaller_dir().join("tools").join("create-gce-image.sh")
    }

    pub fn manager_config(&self) -> PathBuf {
        self.root.join("manager.cfg")
    }

    pub fn manager_workdir(&self) -> PathBuf {
        self.root.join("workdir")
    }

    /// Scratch directory for local kernel builds.
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn linux_dir(&self) -> PathBuf {
        self.build_dir().join("linux")
    }

    pub fn artifacts(&self) -> ArtifactLayout {
        ArtifactLayout::new(self.root.join("image"))
    }

    /// Resolve a possibly relative path against the root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Render a path relative to the root when it lies inside it.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}
