//! HTTP transport implementation.
//!
//! This module maps the central wire contract onto HTTP:
//!
//! | call | request | success |
//! |---|---|---|
//! | health | `GET /sync/health` | any 2xx |
//! | push | `POST /sync/push` | 2xx accepted, 409 conflict |
//! | pull | `POST /sync/pull` | 2xx |
//!
//! Other 4xx statuses become [`SyncError::Rejected`] (not retryable) and
//! 5xx statuses [`SyncError::Server`] (retryable). The actual HTTP client is
//! abstracted via a trait; [`ReqwestClient`] is the production one.

use crate::config::{SyncConfig, Timeouts};
use crate::error::{SyncError, SyncResult};
use crate::transport::CentralTransport;
use async_trait::async_trait;
use clinisync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use parking_lot::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const MAX_ERROR_BODY: usize = 256;

/// HTTP method used by the sync endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

/// A request handed to an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// JSON body.
    pub body: Option<Vec<u8>>,
    /// Bearer credential.
    pub bearer: Option<String>,
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure below the HTTP status level.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// No response within the deadline.
    #[error("request timed out")]
    Timeout,
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),
    /// Any other client failure.
    #[error("http client error: {0}")]
    Other(String),
}

impl From<HttpClientError> for SyncError {
    fn from(err: HttpClientError) -> Self {
        match err {
            HttpClientError::Timeout => SyncError::Timeout,
            other => SyncError::transport_retryable(other.to_string()),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. This allows
/// using different HTTP libraries or an in-process loopback.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response, whatever its status.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError>;
}

/// HTTP-based central transport with JSON bodies.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of central (e.g., "https://central.example.org").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Node credential sent as a bearer token.
    credential: Option<String>,
    /// Per-call deadlines.
    timeouts: Timeouts,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            credential: None,
            timeouts: Timeouts::default(),
            last_error: RwLock::new(None),
        }
    }

    /// Creates a transport for the central URL, credential and timeouts of
    /// `config`.
    pub fn from_config(config: &SyncConfig, client: C) -> Self {
        let transport =
            Self::new(config.central_url.clone(), client).with_timeouts(config.timeouts);
        match &config.credential {
            Some(credential) => transport.with_credential(credential.clone()),
            None => transport,
        }
    }

    /// Sets the bearer credential.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Sets the per-call timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> SyncResult<HttpResponse> {
        let request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            body,
            bearer: self.credential.clone(),
            timeout,
        };

        match self.client.send(request).await {
            Ok(response) => {
                debug!(path, status = response.status, "central responded");
                if response.is_success() || response.status == 409 {
                    *self.last_error.write() = None;
                } else {
                    *self.last_error.write() = Some(format!("{path}: HTTP {}", response.status));
                }
                Ok(response)
            }
            Err(e) => {
                *self.last_error.write() = Some(e.to_string());
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl<C: HttpClient> CentralTransport for HttpTransport<C> {
    async fn health(&self) -> SyncResult<()> {
        let response = self
            .send(Method::Get, "/sync/health", None, self.timeouts.health)
            .await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(status_error(&response))
        }
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let body = request.encode()?;
        let response = self
            .send(Method::Post, "/sync/push", Some(body), self.timeouts.push)
            .await?;

        if response.is_success() {
            return Ok(PushResponse::decode(&response.body)?);
        }
        if response.status == 409 {
            if let Ok(conflict) = PushResponse::decode(&response.body) {
                if conflict.is_conflict() {
                    return Ok(conflict);
                }
            }
        }
        Err(status_error(&response))
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        let body = request.encode()?;
        let response = self
            .send(Method::Post, "/sync/pull", Some(body), self.timeouts.pull)
            .await?;

        if response.is_success() {
            Ok(PullResponse::decode(&response.body)?)
        } else {
            Err(status_error(&response))
        }
    }
}

/// Maps a non-success status to the error taxonomy.
fn status_error(response: &HttpResponse) -> SyncError {
    let mut message = String::from_utf8_lossy(&response.body).into_owned();
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }

    match response.status {
        400..=499 => SyncError::Rejected {
            status: response.status,
            message,
        },
        500..=599 => SyncError::Server {
            status: response.status,
            message,
        },
        other => SyncError::transport_fatal(format!("unexpected HTTP status {other}")),
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with reqwest's defaults.
    pub fn new() -> SyncResult<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(concat!("clinisync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { inner })
    }

    /// Wraps an existing reqwest client.
    pub fn with_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
        let mut builder = match request.method {
            Method::Get => self.inner.get(&request.url),
            Method::Post => self.inner.post(&request.url),
        }
        .timeout(request.timeout);

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?;
        Ok(HttpResponse::new(status, body.to_vec()))
    }
}

fn classify(err: reqwest::Error) -> HttpClientError {
    if err.is_timeout() {
        HttpClientError::Timeout
    } else if err.is_connect() {
        HttpClientError::Connect(err.to_string())
    } else {
        HttpClientError::Other(err.to_string())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a request for `path` and returns status and body.
    fn handle(&self, method: Method, path: &str, body: &[u8]) -> HttpResponse;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing the full HTTP mapping without a network.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
        let path = request
            .url
            .find("/sync/")
            .map(|i| &request.url[i..])
            .unwrap_or(&request.url);
        let body = request.body.as_deref().unwrap_or_default();
        Ok(self.server.handle(request.method, path, body))
    }
}
