//! In-memory cloud doubles for testing and development.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{split_blob_path, BlobStore, CloudError, ImageService, ObjectInfo};

/// Blob store keeping objects in memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object with an explicit modification time.
    pub fn put(&self, path: &str, data: impl Into<Vec<u8>>, updated: DateTime<Utc>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize(path), (data.into(), updated));
    }

    /// Contents of an object, if present.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&normalize(path))
            .map(|(data, _)| data.clone())
    }
}

fn normalize(path: &str) -> String {
    path.strip_prefix("gs://").unwrap_or(path).to_string()
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn stat(&self, path: &str) -> Result<ObjectInfo, CloudError> {
        let (_, object) = split_blob_path(path)?;
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let (data, updated) = objects
            .get(&normalize(path))
            .ok_or_else(|| CloudError::NotFound(path.to_string()))?;
        Ok(ObjectInfo {
            name: object.to_string(),
            updated: *updated,
            size: data.len() as u64,
        })
    }

    async fn download(&self, path: &str, dest: &Path) -> Result<u64, CloudError> {
        let data = self
            .get(path)
            .ok_or_else(|| CloudError::NotFound(path.to_string()))?;
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn upload(&self, local: &Path, path: &str) -> Result<(), CloudError> {
        split_blob_path(path)?;
        let data = tokio::fs::read(local).await?;
        self.put(path, data, Utc::now());
        Ok(())
    }
}

/// Image service call made against [`RecordingImageService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageCall {
    Delete(String),
    Create { name: String, blob_path: String },
}

/// Image service that records calls and can fail the next creation.
#[derive(Debug, Default)]
pub struct RecordingImageService {
    calls: Mutex<Vec<ImageCall>>,
    fail_create: Mutex<Option<String>>,
}

impl RecordingImageService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create_image` call fail with `message`.
    pub fn fail_next_create(&self, message: &str) {
        *self.fail_create.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<ImageCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ImageService for RecordingImageService {
    async fn delete_image(&self, name: &str) -> Result<(), CloudError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ImageCall::Delete(name.to_string()));
        Ok(())
    }

    async fn create_image(&self, name: &str, blob_path: &str) -> Result<(), CloudError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ImageCall::Create {
                name: name.to_string(),
                blob_path: blob_path.to_string(),
            });
        match self.fail_create.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(message) => Err(CloudError::Operation {
                name: format!("create-{name}"),
                message,
            }),
            None => Ok(()),
        }
    }
}
