//! VM image registration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use super::{split_blob_path, CloudError, TokenSource};

/// Default compute API endpoint.
pub const COMPUTE_URL: &str = "https://compute.googleapis.com/compute/v1";

/// License enabling nested virtualization on instances booted from the image.
const NESTED_VIRT_LICENSE: &str = "projects/vm-options/global/licenses/enable-vmx";

/// Image registration operations.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Delete an image; an image that does not exist is not an error.
    async fn delete_image(&self, name: &str) -> Result<(), CloudError>;

    /// Register an image from a disk archive in blob storage.
    async fn create_image(&self, name: &str, blob_path: &str) -> Result<(), CloudError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    name: String,
    status: String,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Deserialize)]
struct OperationErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn failure(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        let messages: Vec<String> = error
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect();
        Some(if messages.is_empty() {
            "unknown error".to_string()
        } else {
            messages.join("; ")
        })
    }
}

/// Compute API client scoped to one project.
pub struct GceClient {
    client: reqwest::Client,
    api_url: String,
    project: String,
    tokens: Arc<dyn TokenSource>,
    poll_interval: Duration,
    operation_timeout: Duration,
}

impl GceClient {
    /// Create a client against the public endpoint.
    pub fn new(project: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Result<Self, CloudError> {
        Self::with_api_url(COMPUTE_URL, project, tokens)
    }

    /// Create a client against a specific endpoint.
    pub fn with_api_url(
        api_url: impl Into<String>,
        project: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into(),
            project: project.into(),
            tokens,
            poll_interval: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30 * 60),
        })
    }

    /// Override how operations are polled.
    pub fn with_operation_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.operation_timeout = timeout;
        self
    }

    fn images_url(&self) -> String {
        format!("{}/projects/{}/global/images", self.api_url, self.project)
    }

    async fn parse_operation(
        method: &'static str,
        response: reqwest::Response,
    ) -> Result<Operation, CloudError> {
        let status = response.status();
        if !status.is_success() {
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Status {
                method,
                url,
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// Poll a global operation until it is done.
    async fn wait_operation(&self, mut op: Operation) -> Result<(), CloudError> {
        let deadline = Instant::now() + self.operation_timeout;
        loop {
            if op.status == "DONE" {
                return match op.failure() {
                    Some(message) => Err(CloudError::Operation {
                        name: op.name,
                        message,
                    }),
                    None => Ok(()),
                };
            }
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(op.name));
            }
            tokio::time::sleep(self.poll_interval).await;

            debug!(operation = %op.name, status = %op.status, "Waiting for operation");
            let url = format!(
                "{}/projects/{}/global/operations/{}",
                self.api_url, self.project, op.name
            );
            let token = self.tokens.access_token().await?;
            let response = self.client.get(url).bearer_auth(token).send().await?;
            op = Self::parse_operation("GET", response).await?;
        }
    }
}

#[async_trait]
impl ImageService for GceClient {
    async fn delete_image(&self, name: &str) -> Result<(), CloudError> {
        let url = format!("{}/{}", self.images_url(), name);
        let token = self.tokens.access_token().await?;
        let response = self.client.delete(url).bearer_auth(token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(image = %name, "Image does not exist");
            return Ok(());
        }
        let op = Self::parse_operation("DELETE", response).await?;
        self.wait_operation(op).await?;
        info!(image = %name, "Image deleted");
        Ok(())
    }

    async fn create_image(&self, name: &str, blob_path: &str) -> Result<(), CloudError> {
        let (bucket, object) = split_blob_path(blob_path)?;
        let body = serde_json::json!({
            "name": name,
            "rawDisk": {
                "source": format!("https://storage.googleapis.com/{bucket}/{object}"),
            },
            "licenses": [NESTED_VIRT_LICENSE],
        });

        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .post(self.images_url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let op = Self::parse_operation("POST", response).await?;
        self.wait_operation(op).await?;
        info!(image = %name, source = %blob_path, "Image created");
        Ok(())
    }
}
