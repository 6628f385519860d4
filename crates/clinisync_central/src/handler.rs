//! Request handlers for the sync endpoints.

use crate::changelog::{ChangeLog, PushVerdict};
use crate::config::CentralConfig;
use crate::error::{CentralError, CentralResult};
use chrono::Utc;
use clinisync_protocol::{HealthResponse, PullRequest, PullResponse, PushRequest, PushResponse};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Context shared by all handlers.
pub struct HandlerContext {
    /// Central configuration.
    pub config: CentralConfig,
    /// Document state and change log.
    pub log: Arc<ChangeLog>,
    available: AtomicBool,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: CentralConfig, log: Arc<ChangeLog>) -> Self {
        Self {
            config,
            log,
            available: AtomicBool::new(true),
        }
    }

    /// Sets whether requests are served.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns true if requests are served.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> CentralResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CentralError::Unavailable)
        }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a liveness probe.
    pub fn handle_health(&self) -> CentralResult<HealthResponse> {
        self.context.ensure_available()?;
        Ok(HealthResponse {
            ok: true,
            timestamp: Utc::now(),
        })
    }

    /// Handles a single-item push.
    pub fn handle_push(&self, request: &PushRequest) -> CentralResult<PushResponse> {
        self.context.ensure_available()?;
        self.validate_push(request)?;

        let item = &request.item;
        let response = match self.context.log.push(&request.node_id, item) {
            PushVerdict::Accepted | PushVerdict::Duplicate | PushVerdict::Superseded => {
                PushResponse::accepted()
            }
            PushVerdict::Conflict(central) => PushResponse::conflict(central),
        };
        debug!(
            node_id = %request.node_id,
            sync_id = %item.sync_id,
            collection = %item.collection,
            document_id = %item.document_id,
            conflict = response.is_conflict(),
            "push handled"
        );
        Ok(response)
    }

    /// Handles a pull.
    pub fn handle_pull(&self, request: &PullRequest) -> CentralResult<PullResponse> {
        self.context.ensure_available()?;
        if request.node_id.trim().is_empty() {
            return Err(CentralError::InvalidRequest("nodeId is required".into()));
        }

        let limit = request.limit.min(self.context.config.max_pull_batch).max(1);
        let (changes, has_more, timestamp) =
            self.context
                .log
                .changes_since(&request.node_id, request.since, limit as usize);
        Ok(PullResponse::new(changes, timestamp, has_more))
    }

    /// Routes a raw HTTP request and returns status and JSON body.
    ///
    /// Conflicts are answered with 409 and the conflict body; errors with
    /// their status and `{"error": message}`.
    pub fn handle_http(&self, method: &str, path: &str, body: &[u8]) -> (u16, Vec<u8>) {
        let result = match (method, path) {
            ("GET", "/sync/health") => self.health_http(),
            ("POST", "/sync/push") => self.push_http(body),
            ("POST", "/sync/pull") => self.pull_http(body),
            _ => Err(CentralError::NotFound {
                method: method.to_string(),
                path: path.to_string(),
            }),
        };

        result.unwrap_or_else(|e| {
            if e.is_server_error() {
                warn!(method, path, error = %e, "request failed");
            } else {
                debug!(method, path, error = %e, "request rejected");
            }
            let body = json!({ "error": e.to_string() }).to_string().into_bytes();
            (e.status_code(), body)
        })
    }

    fn health_http(&self) -> CentralResult<(u16, Vec<u8>)> {
        let response = self.handle_health()?;
        Ok((200, response.encode().map_err(internal)?))
    }

    fn push_http(&self, body: &[u8]) -> CentralResult<(u16, Vec<u8>)> {
        let request = PushRequest::decode(body)?;
        let response = self.handle_push(&request)?;
        let status = if response.is_conflict() { 409 } else { 200 };
        Ok((status, response.encode().map_err(internal)?))
    }

    fn pull_http(&self, body: &[u8]) -> CentralResult<(u16, Vec<u8>)> {
        let request = PullRequest::decode(body)?;
        let response = self.handle_pull(&request)?;
        Ok((200, response.encode().map_err(internal)?))
    }

    fn validate_push(&self, request: &PushRequest) -> CentralResult<()> {
        let item = &request.item;
        if request.node_id.trim().is_empty() {
            return Err(CentralError::InvalidRequest("nodeId is required".into()));
        }
        if item.collection.is_empty() || item.document_id.is_empty() {
            return Err(CentralError::InvalidRequest(
                "collection and documentId are required".into(),
            ));
        }
        match &item.data {
            None if !item.operation.is_delete() => Err(CentralError::InvalidRequest(format!(
                "{} requires data",
                item.operation
            ))),
            Some(data) => {
                let size = serde_json::to_vec(data).map_err(internal)?.len();
                let limit = self.context.config.max_payload_bytes;
                if size > limit {
                    Err(CentralError::PayloadTooLarge { size, limit })
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }
}

fn internal(err: impl std::fmt::Display) -> CentralError {
    CentralError::Internal(err.to_string())
}
