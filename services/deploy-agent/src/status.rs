//! Status HTTP interface.
//!
//! Read-only endpoints for health checks, proxies and operators:
//!
//! - `GET /healthz`: liveness.
//! - `GET /status`: agent name and the current manager port (0 when stopped).
//! - `GET /log`: recent log lines.

use std::net::{Ipv4Addr, SocketAddr};

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::logging::LogCache;
use crate::process::WorkerPort;

/// Shared state of the status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub name: String,
    pub port: WorkerPort,
    pub logs: LogCache,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    /// ISO 8601.
    pub timestamp: String,
}

/// Manager status response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct StatusResponse {
    pub name: String,

    /// Manager HTTP port, 0 when no manager is running.
    pub manager_port: u16,

    /// Manager status page, if running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager_url: Option<String>,
}

/// Create the status routes.
pub fn routes(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/log", get(log))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "deploy-agent".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn status(State(state): State<StatusState>) -> impl IntoResponse {
    let port = state.port.get();
    Json(StatusResponse {
        name: state.name,
        manager_port: port,
        manager_url: (port != 0).then(|| format!("http://localhost:{port}")),
    })
}

async fn log(State(state): State<StatusState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.logs.contents(),
    )
}

/// Bind the status server on all interfaces and serve it in the background.
pub async fn serve(http_port: u16, state: StatusState) -> std::io::Result<JoinHandle<()>> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, http_port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Status server listening");

    let app = routes(state);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Status server failed");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> StatusState {
        StatusState {
            name: "ci-upstream".to_string(),
            port: WorkerPort::new(),
            logs: LogCache::default(),
        }
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body) = get_body(routes(state()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.service, "deploy-agent");
    }

    #[tokio::test]
    async fn test_status_reports_port() {
        let state = state();
        let (_, body) = get_body(routes(state.clone()), "/status").await;
        let status: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.name, "ci-upstream");
        assert_eq!(status.manager_port, 0);
        assert_eq!(status.manager_url, None);
    }

    #[tokio::test]
    async fn test_log_serves_cache() {
        let state = state();
        state.logs.push("Source changed");
        let (status, body) = get_body(routes(state), "/log").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"Source changed\n");
    }
}
