//! Backend nodes and request forwarding

use axum::body::{Body, Bytes};
use axum::http::header::HeaderMap;
use axum::http::{HeaderName, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use pblb_core::{NodeConfig, PblbError, PblbResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Build the client used to forward requests
///
/// Redirects are relayed to the caller rather than followed.
pub fn forward_client(timeout: Duration) -> PblbResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| PblbError::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Failure while proxying one request
#[derive(Error, Debug)]
pub enum ForwardError {
    /// The inbound request body could not be buffered
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] axum::Error),

    /// The backend could not be reached or did not answer in time
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),

    /// The backend answered but its body could not be read
    #[error("failed to read upstream body: {0}")]
    UpstreamBody(#[source] reqwest::Error),
}

impl ForwardError {
    /// Status reported to the caller
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ForwardError::Upstream(_) | ForwardError::UpstreamBody(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether the failure says anything about the backend
    ///
    /// False when the request failed locally before the node was contacted.
    pub fn reached_backend(&self) -> bool {
        !matches!(self, ForwardError::RequestBody(_))
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// One backend server
///
/// Nodes start healthy with no active connections. Only the selector that
/// owns a node changes its health flag.
#[derive(Debug)]
pub struct Node {
    address: String,
    port: u16,
    health_path: String,
    healthy: AtomicBool,
    active_connections: AtomicUsize,
}

impl Node {
    /// Create a new node
    pub fn new(address: impl Into<String>, port: u16, health_path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            health_path: health_path.into(),
            healthy: AtomicBool::new(true),
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Create a node from its configuration entry
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.address.clone(), config.port, config.health.clone())
    }

    /// Host address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL for this node
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// URL probed by health checks
    pub fn health_url(&self) -> String {
        format!("{}{}", self.url(), self.health_path)
    }

    /// Whether the node is currently in rotation
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Set the health flag, returning the previous value
    pub(crate) fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    /// Number of requests currently being forwarded to this node
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Count one in-flight request until the guard is dropped
    pub(crate) fn track_connection(&self) -> ActiveConnectionGuard<'_> {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        ActiveConnectionGuard { node: self }
    }

    /// Probe the node's health endpoint
    ///
    /// Returns true only for a `200 OK` answer. The health flag is left
    /// untouched; applying the outcome is up to the selector.
    pub async fn check_health(&self, client: &reqwest::Client) -> bool {
        let url = self.health_url();

        match client.get(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                debug!(endpoint = %url, "Health check passed");
                true
            }
            Ok(response) => {
                warn!(
                    endpoint = %url,
                    status = %response.status(),
                    "Health check failed"
                );
                false
            }
            Err(e) => {
                warn!(
                    endpoint = %url,
                    error = %e,
                    "Health check error"
                );
                false
            }
        }
    }

    /// Proxy one request to this node
    ///
    /// On success the response carries the upstream status, headers and
    /// body. The in-flight count covers the whole call, whatever the result.
    pub async fn forward(
        &self,
        client: &reqwest::Client,
        request: Request<Body>,
        max_body_bytes: usize,
    ) -> Result<Response, ForwardError> {
        let _connection = self.track_connection();

        let (parts, body) = request.into_parts();
        let body: Bytes = axum::body::to_bytes(body, max_body_bytes)
            .await
            .map_err(ForwardError::RequestBody)?;

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.url(), path);

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(axum::http::header::HOST);

        let upstream = client
            .request(parts.method, url.as_str())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(ForwardError::Upstream)?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(axum::http::header::CONTENT_LENGTH);

        let body = upstream.bytes().await.map_err(ForwardError::UpstreamBody)?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(HeaderName::from_static(name));
    }
}

/// Decrements the node's active connection count when dropped
pub struct ActiveConnectionGuard<'a> {
    node: &'a Node,
}

impl Drop for ActiveConnectionGuard<'_> {
    fn drop(&mut self) {
        self.node.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}
