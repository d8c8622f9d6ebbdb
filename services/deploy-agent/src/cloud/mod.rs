//! Cloud collaborators: blob storage, VM image registration, instance metadata.
//!
//! Each collaborator is a trait so the change sources can be tested with the
//! in-memory doubles from [`fake`]. Production implementations talk to the
//! GCP JSON APIs with a bearer token from the instance metadata server.

pub mod compute;
pub mod fake;
pub mod metadata;
pub mod publish;
pub mod storage;

use thiserror::Error;

pub use compute::{GceClient, ImageService};
pub use metadata::{InstanceInfo, MetadataClient, StaticToken, TokenSource};
pub use publish::ImagePublisher;
pub use storage::{BlobStore, GcsClient, ObjectInfo};

/// Errors from cloud API calls.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{method} {url} failed: {status} - {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("operation {name} failed: {message}")]
    Operation { name: String, message: String },

    #[error("timed out waiting for operation {0}")]
    Timeout(String),
}

/// Split `gs://bucket/object` or `bucket/object` into its parts.
pub fn split_blob_path(path: &str) -> Result<(&str, &str), CloudError> {
    let trimmed = path.strip_prefix("gs://").unwrap_or(path);
    match trimmed.split_once('/') {
        Some((bucket, object)) if !bucket.is_empty() && !object.is_empty() => Ok((bucket, object)),
        _ => Err(CloudError::InvalidPath(path.to_string())),
    }
}
