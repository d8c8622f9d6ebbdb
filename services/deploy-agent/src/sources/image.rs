//! Prebuilt image archive source.

use std::sync::Arc;

use async_trait::async_trait;
use fuzzdeploy_reconcile::Token;
use tracing::info;

use super::{ChangeSource, SourceContext};
use crate::archive::install_image_archive;
use crate::cloud::{BlobStore, ImagePublisher};
use crate::error::SourceError;
use crate::layout::WorkspaceLayout;

/// Fetches a prebuilt image archive from blob storage.
pub struct ImageSource {
    storage: Arc<dyn BlobStore>,
    publisher: ImagePublisher,
    workspace: WorkspaceLayout,
    archive: String,
}

impl ImageSource {
    pub fn new(
        storage: Arc<dyn BlobStore>,
        publisher: ImagePublisher,
        workspace: WorkspaceLayout,
        archive: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            publisher,
            workspace,
            archive: archive.into(),
        }
    }
}

#[async_trait]
impl ChangeSource for ImageSource {
    fn name(&self) -> &str {
        "GCS image"
    }

    async fn identify(&mut self, _ctx: &mut SourceContext) -> Result<Token, SourceError> {
        let info = self.storage.stat(&self.archive).await?;
        Ok(Token::new(info.updated.to_rfc2822()))
    }

    async fn rebuild(&mut self, _ctx: &mut SourceContext) -> Result<(), SourceError> {
        info!(archive = %self.archive, "Downloading image archive");
        let download = self.workspace.root().join("image.download.tar.gz");
        self.storage.download(&self.archive, &download).await?;

        let artifacts = self.workspace.artifacts();
        let layout = artifacts.clone();
        let archive = download.clone();
        let installed =
            tokio::task::spawn_blocking(move || install_image_archive(&archive, &layout))
                .await
                .map_err(|e| SourceError::Task(e.to_string()));
        tokio::fs::remove_file(&download).await.ok();
        installed??;

        self.publisher
            .publish(&artifacts.disk_archive_path())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::{ImageCall, MemoryBlobStore, RecordingImageService};
    use chrono::TimeZone;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn image_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for (path, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        workspace: WorkspaceLayout,
        storage: Arc<MemoryBlobStore>,
        images: Arc<RecordingImageService>,
        source: ImageSource,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = WorkspaceLayout::new(dir.path());
        let storage = Arc::new(MemoryBlobStore::new());
        let images = Arc::new(RecordingImageService::new());
        let publisher =
            ImagePublisher::new(storage.clone(), images.clone(), "bucket/disk.tar.gz", "ci-image");
        let source = ImageSource::new(
            storage.clone(),
            publisher,
            workspace.clone(),
            "gs://bucket/image.tar.gz",
        );
        Fixture {
            _dir: dir,
            workspace,
            storage,
            images,
            source,
        }
    }

    #[tokio::test]
    async fn test_identify_uses_modification_time() {
        let f = fixture();
        let mut source = f.source;
        let updated = chrono::Utc.with_ymd_and_hms(2016, 11, 15, 10, 0, 0).unwrap();
        f.storage.put("bucket/image.tar.gz", b"x".to_vec(), updated);

        let token = source.identify(&mut SourceContext::default()).await.unwrap();
        assert_eq!(token.as_str(), "Tue, 15 Nov 2016 10:00:00 +0000");
    }

    #[tokio::test]
    async fn test_identify_missing_archive() {
        let mut f = fixture();
        let err = f
            .source
            .identify(&mut SourceContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "cloud_error");
    }

    #[tokio::test]
    async fn test_rebuild_extracts_and_publishes() {
        let mut f = fixture();
        let archive = image_archive(&[
            ("disk.tar.gz", b"disk"),
            ("tag", b"abc123\n"),
            ("obj/vmlinux", b"elf"),
            ("key", b"ssh-key"),
        ]);
        f.storage.put("bucket/image.tar.gz", archive, chrono::Utc::now());

        f.source.rebuild(&mut SourceContext::default()).await.unwrap();

        let artifacts = f.workspace.artifacts();
        assert_eq!(artifacts.read_tag().unwrap(), "abc123");
        assert!(artifacts.ssh_key().is_some());
        assert!(!f.workspace.root().join("image.download.tar.gz").exists());
        assert_eq!(f.storage.get("bucket/disk.tar.gz").unwrap(), b"disk");
        assert_eq!(
            f.images.calls()[0],
            ImageCall::Delete("ci-image".to_string())
        );
    }

    #[tokio::test]
    async fn test_incomplete_archive_keeps_previous_image() {
        let mut f = fixture();
        f.workspace.artifacts().write_tag("old").unwrap();
        let archive = image_archive(&[("disk.tar.gz", b"disk"), ("tag", b"new")]);
        f.storage.put("bucket/image.tar.gz", archive, chrono::Utc::now());

        let err = f
            .source
            .rebuild(&mut SourceContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "archive_invalid");
        assert_eq!(f.workspace.artifacts().read_tag().unwrap(), "old");
        assert!(f.images.calls().is_empty());
    }
}
