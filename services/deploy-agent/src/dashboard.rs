//! Code-review dashboard client.
//!
//! The dashboard publishes the patch set that local kernel builds carry on
//! top of the configured branch. Every call is a POST to `<addr>/api` with
//! the client name, key and method in the query string.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Dashboard errors.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode request: {0}")]
    Encode(#[from] std::io::Error),

    #[error("malformed {method} reply: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A patch published by the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(rename = "Title")]
    pub title: String,

    /// Unified diff, base64 on the wire.
    #[serde(rename = "Diff", with = "base64_bytes")]
    pub diff: Vec<u8>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Patch-set queries against the dashboard.
#[async_trait]
pub trait PatchDashboard: Send + Sync {
    /// Identity of the current patch set.
    async fn poll_patches(&self) -> Result<String, DashboardError>;

    /// Contents of the current patch set.
    async fn get_patches(&self) -> Result<Vec<Patch>, DashboardError>;
}

/// HTTP dashboard client.
pub struct DashboardClient {
    client: reqwest::Client,
    addr: String,
    name: String,
    key: String,
}

impl DashboardClient {
    pub fn new(
        addr: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Result<Self, DashboardError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            addr: addr.into().trim_end_matches('/').to_string(),
            name: name.into(),
            key: key.into(),
        })
    }

    async fn query<Req, Reply>(
        &self,
        method: &'static str,
        request: Option<&Req>,
    ) -> Result<Reply, DashboardError>
    where
        Req: Serialize + Sync,
        Reply: DeserializeOwned,
    {
        debug!(method, addr = %self.addr, "Querying dashboard");

        let mut builder = self
            .client
            .post(format!("{}/api", self.addr))
            .query(&[
                ("client", self.name.as_str()),
                ("key", self.key.as_str()),
                ("method", method),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(request) = request {
            let data = serde_json::to_vec(request).map_err(std::io::Error::other)?;
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            gz.write_all(&data)?;
            builder = builder.body(gz.finish()?);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DashboardError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| DashboardError::Decode { method, source })
    }
}

#[async_trait]
impl PatchDashboard for DashboardClient {
    async fn poll_patches(&self) -> Result<String, DashboardError> {
        self.query::<(), String>("poll_patches", None).await
    }

    async fn get_patches(&self) -> Result<Vec<Patch>, DashboardError> {
        let patches: Option<Vec<Patch>> = self.query::<(), _>("get_patches", None).await?;
        Ok(patches.unwrap_or_default())
    }
}
