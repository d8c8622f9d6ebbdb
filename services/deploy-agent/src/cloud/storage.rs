//! Blob storage client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{split_blob_path, CloudError, TokenSource};

/// Default storage API endpoint.
pub const STORAGE_URL: &str = "https://storage.googleapis.com";

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object name within its bucket.
    pub name: String,

    /// Last modification time.
    pub updated: DateTime<Utc>,

    /// Size in bytes.
    pub size: u64,
}

/// Blob storage operations used by the image sources.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read object metadata.
    async fn stat(&self, path: &str) -> Result<ObjectInfo, CloudError>;

    /// Download an object to a local file, returning the byte count.
    async fn download(&self, path: &str, dest: &Path) -> Result<u64, CloudError>;

    /// Upload a local file, replacing the object.
    async fn upload(&self, local: &Path, path: &str) -> Result<(), CloudError>;
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    updated: DateTime<Utc>,
    #[serde(default)]
    size: Option<String>,
}

/// Storage JSON API client.
pub struct GcsClient {
    client: reqwest::Client,
    api_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl GcsClient {
    /// Create a client against the public endpoint.
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self, CloudError> {
        Self::with_api_url(STORAGE_URL, tokens)
    }

    /// Create a client against a specific endpoint.
    pub fn with_api_url(
        api_url: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            tokens,
        })
    }

    fn object_url(&self, prefix: &str, bucket: &str, object: &str) -> Result<Url, CloudError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| CloudError::InvalidPath(format!("{}: {e}", self.api_url)))?;
        url.path_segments_mut()
            .map_err(|_| CloudError::InvalidPath(self.api_url.clone()))?
            .pop_if_empty()
            .extend(prefix.split('/'))
            .extend(["b", bucket, "o", object]);
        Ok(url)
    }

    async fn check(
        method: &'static str,
        path: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, CloudError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(CloudError::NotFound(path.to_string())),
            status => {
                let url = response.url().to_string();
                let body = response.text().await.unwrap_or_default();
                Err(CloudError::Status {
                    method,
                    url,
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[async_trait]
impl BlobStore for GcsClient {
    async fn stat(&self, path: &str) -> Result<ObjectInfo, CloudError> {
        let (bucket, object) = split_blob_path(path)?;
        let url = self.object_url("storage/v1", bucket, object)?;
        debug!(url = %url, "Reading object metadata");

        let token = self.tokens.access_token().await?;
        let response = self.client.get(url).bearer_auth(token).send().await?;
        let resource: ObjectResource = Self::check("GET", path, response).await?.json().await?;

        Ok(ObjectInfo {
            name: resource.name,
            updated: resource.updated,
            size: resource
                .size
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
        })
    }

    async fn download(&self, path: &str, dest: &Path) -> Result<u64, CloudError> {
        let (bucket, object) = split_blob_path(path)?;
        let mut url = self.object_url("storage/v1", bucket, object)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let token = self.tokens.access_token().await?;
        let response = self.client.get(url).bearer_auth(token).send().await?;
        let response = Self::check("GET", path, response).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        info!(path = %path, bytes = total, "Object downloaded");
        Ok(total)
    }

    async fn upload(&self, local: &Path, path: &str) -> Result<(), CloudError> {
        let (bucket, object) = split_blob_path(path)?;
        let mut url = self.object_url("upload/storage/v1", bucket, "")?;
        // The upload endpoint takes the object name as a query parameter.
        url.path_segments_mut()
            .map_err(|_| CloudError::InvalidPath(self.api_url.clone()))?
            .pop();
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", object);

        let file = tokio::fs::File::open(local).await?;
        let size = file.metadata().await?.len();

        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::from(file))
            .send()
            .await?;
        Self::check("POST", path, response).await?;

        info!(path = %path, bytes = size, "Object uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::StaticToken;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GcsClient {
        GcsClient::with_api_url(server.uri(), Arc::new(StaticToken("tok".to_string()))).unwrap()
    }

    #[tokio::test]
    async fn test_stat_parses_updated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bucket/o/dir%2Fimage.tar.gz"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "dir/image.tar.gz",
                "updated": "2016-11-05T10:00:00.000Z",
                "size": "1024"
            })))
            .mount(&server)
            .await;

        let info = client(&server)
            .stat("gs://bucket/dir/image.tar.gz")
            .await
            .unwrap();
        assert_eq!(info.name, "dir/image.tar.gz");
        assert_eq!(info.size, 1024);
        assert_eq!(info.updated.to_rfc3339(), "2016-11-05T10:00:00+00:00");
    }

    #[tokio::test]
    async fn test_stat_not_found() {
        let server = MockServer::start().await;
        let err = client(&server).stat("bucket/missing").await.unwrap_err();
        assert!(matches!(err, CloudError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_download_writes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/bucket/o/image.tar.gz"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"archive-bytes".to_vec()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dl/image.tar.gz");

        let n = client(&server)
            .download("bucket/image.tar.gz", &dest)
            .await
            .unwrap();
        assert_eq!(n, 13);
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive-bytes");
    }

    #[tokio::test]
    async fn test_upload_posts_media() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/bucket/o"))
            .and(query_param("uploadType", "media"))
            .and(query_param("name", "images/disk.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("disk.tar.gz");
        std::fs::write(&local, b"disk").unwrap();

        client(&server)
            .upload(&local, "bucket/images/disk.tar.gz")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("disk.tar.gz");
        std::fs::write(&local, b"disk").unwrap();

        let err = client(&server)
            .upload(&local, "bucket/disk.tar.gz")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Status { status: 403, .. }));
    }
}
