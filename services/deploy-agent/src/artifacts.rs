//! Well-known artifact directory layout.
//!
//! Both image sources leave their output in the same shape, which the
//! manager config generation reads:
//!
//! ```text
//! image/
//! ├── tag            revision identifier, optionally newline-terminated
//! ├── disk.tar.gz    bootable disk archive for image registration
//! ├── key            optional SSH key
//! └── obj/vmlinux    debug symbols
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Archive members an image must contain.
pub const REQUIRED_MEMBERS: [&str; 3] = ["disk.tar.gz", "tag", "obj/vmlinux"];

/// Paths inside an artifact directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    /// Layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The artifact directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tag_path(&self) -> PathBuf {
        self.root.join("tag")
    }

    pub fn disk_archive_path(&self) -> PathBuf {
        self.root.join("disk.tar.gz")
    }

    pub fn key_path(&self) -> PathBuf {
        self.root.join("key")
    }

    pub fn obj_dir(&self) -> PathBuf {
        self.root.join("obj")
    }

    pub fn vmlinux_path(&self) -> PathBuf {
        self.obj_dir().join("vmlinux")
    }

    /// Read the revision tag with one trailing newline stripped.
    pub fn read_tag(&self) -> io::Result<String> {
        let mut tag = fs::read_to_string(self.tag_path())?;
        if tag.ends_with('\n') {
            tag.pop();
        }
        Ok(tag)
    }

    /// Write the revision tag.
    pub fn write_tag(&self, tag: &str) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.tag_path(), tag)
    }

    /// SSH key path if the key artifact is present.
    pub fn ssh_key(&self) -> Option<PathBuf> {
        let path = self.key_path();
        path.is_file().then_some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("abc123\n", "abc123")]
    #[case("abc123", "abc123")]
    #[case("abc123\n\n", "abc123\n")]
    #[case("", "")]
    fn test_read_tag_strips_one_newline(#[case] raw: &str, #[case] expected: &str) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        fs::write(layout.tag_path(), raw).unwrap();
        assert_eq!(layout.read_tag().unwrap(), expected);
    }

    #[test]
    fn test_ssh_key_optional() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        assert_eq!(layout.ssh_key(), None);

        fs::write(layout.key_path(), "key").unwrap();
        assert_eq!(layout.ssh_key(), Some(dir.path().join("key")));
    }

    #[test]
    fn test_write_tag_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path().join("image"));
        layout.write_tag("rev").unwrap();
        assert_eq!(layout.read_tag().unwrap(), "rev");
        assert_eq!(layout.vmlinux_path(), dir.path().join("image/obj/vmlinux"));
    }
}
