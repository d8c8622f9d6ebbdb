//! Disk image publication: upload, then re-register under a fixed name.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use super::{BlobStore, CloudError, ImageService};

/// Publishes a disk archive as the VM image the manager boots.
#[derive(Clone)]
pub struct ImagePublisher {
    storage: Arc<dyn BlobStore>,
    images: Arc<dyn ImageService>,
    image_path: String,
    image_name: String,
}

impl ImagePublisher {
    pub fn new(
        storage: Arc<dyn BlobStore>,
        images: Arc<dyn ImageService>,
        image_path: impl Into<String>,
        image_name: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            images,
            image_path: image_path.into(),
            image_name: image_name.into(),
        }
    }

    /// Upload `disk_archive` and replace the registered image with it.
    pub async fn publish(&self, disk_archive: &Path) -> Result<(), CloudError> {
        info!(
            archive = %disk_archive.display(),
            path = %self.image_path,
            "Uploading disk image"
        );
        self.storage.upload(disk_archive, &self.image_path).await?;

        info!(image = %self.image_name, "Recreating VM image");
        self.images.delete_image(&self.image_name).await?;
        self.images
            .create_image(&self.image_name, &self.image_path)
            .await
    }
}
