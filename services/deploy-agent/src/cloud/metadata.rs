//! Instance metadata server client.
//!
//! Provides the instance identity logged at startup and OAuth access tokens
//! for the storage and compute APIs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::CloudError;

/// Default metadata server endpoint.
pub const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Source of bearer tokens for cloud API calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a currently valid access token.
    async fn access_token(&self) -> Result<String, CloudError>;
}

/// Fixed token, for testing and development.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, CloudError> {
        Ok(self.0.clone())
    }
}

/// Identity of the instance the agent runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance: String,
    pub internal_ip: String,
    pub project_id: String,
    pub zone: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Metadata server client.
pub struct MetadataClient {
    client: reqwest::Client,
    base_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl MetadataClient {
    /// Create a client for the default metadata server.
    pub fn new() -> Result<Self, CloudError> {
        Self::with_base_url(METADATA_URL)
    }

    /// Create a client for a specific endpoint.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            token: Mutex::new(None),
        })
    }

    async fn get(&self, path: &str) -> Result<String, CloudError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, "Querying metadata server");

        let response = self
            .client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::Status {
                method: "GET",
                url,
                status,
                body,
            });
        }

        Ok(response.text().await?.trim().to_string())
    }

    /// Query instance name, internal IP, project and zone.
    pub async fn instance_info(&self) -> Result<InstanceInfo, CloudError> {
        let instance = self.get("instance/name").await?;
        let internal_ip = self.get("instance/network-interfaces/0/ip").await?;
        let project_id = self.get("project/project-id").await?;
        // Returned as projects/<number>/zones/<zone>.
        let zone = self.get("instance/zone").await?;
        let zone = zone.rsplit('/').next().unwrap_or(&zone).to_string();

        Ok(InstanceInfo {
            instance,
            internal_ip,
            project_id,
            zone,
        })
    }
}

#[async_trait]
impl TokenSource for MetadataClient {
    async fn access_token(&self) -> Result<String, CloudError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        let body = self
            .get("instance/service-accounts/default/token")
            .await?;
        let response: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            CloudError::Operation {
                name: "token".to_string(),
                message: format!("malformed token response: {e}"),
            }
        })?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            token: response.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(response.access_token)
    }
}
