//! Central authority facade.

use crate::changelog::{ChangeLog, CENTRAL_NODE};
use crate::config::CentralConfig;
use crate::error::CentralResult;
use crate::handler::{HandlerContext, RequestHandler};
use chrono::{DateTime, Utc};
use clinisync_protocol::{
    HealthResponse, Operation, PullRequest, PullResponse, PushRequest, PushResponse,
};
use serde_json::Value;
use std::sync::Arc;

/// The central authority that clinic nodes sync against.
///
/// Accepts single-item pushes, serves ordered pull pages and answers
/// liveness probes. State lives in memory.
///
/// # Example
///
/// ```
/// use clinisync_central::{CentralConfig, CentralServer};
///
/// let server = CentralServer::new(CentralConfig::default());
/// let (status, _body) = server.handle_http("GET", "/sync/health", b"");
/// assert_eq!(status, 200);
/// ```
pub struct CentralServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl CentralServer {
    /// Creates a new central server.
    pub fn new(config: CentralConfig) -> Self {
        Self::with_log(config, Arc::new(ChangeLog::new()))
    }

    /// Creates a central server over an existing change log.
    pub fn with_log(config: CentralConfig, log: Arc<ChangeLog>) -> Self {
        let context = Arc::new(HandlerContext::new(config, log));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Handles a liveness probe.
    pub fn handle_health(&self) -> CentralResult<HealthResponse> {
        self.handler.handle_health()
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: &PushRequest) -> CentralResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: &PullRequest) -> CentralResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Routes a raw HTTP request to the matching endpoint.
    pub fn handle_http(&self, method: &str, path: &str, body: &[u8]) -> (u16, Vec<u8>) {
        self.handler.handle_http(method, path, body)
    }

    /// Takes central offline (`false`) or back online (`true`).
    pub fn set_available(&self, available: bool) {
        self.context.set_available(available);
    }

    /// Returns true if central is serving requests.
    pub fn is_available(&self) -> bool {
        self.context.is_available()
    }

    /// Edits a document directly on central.
    ///
    /// `None` deletes the document. The edit is pulled by every node.
    pub fn put_document(
        &self,
        collection: &str,
        document_id: &str,
        data: Option<Value>,
        changed_at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let operation = match (&data, self.document(collection, document_id)) {
            (None, _) => Operation::Delete,
            (Some(_), Some(_)) => Operation::Update,
            (Some(_), None) => Operation::Create,
        };
        self.context.log.write(
            CENTRAL_NODE,
            collection,
            document_id,
            operation,
            data,
            changed_at,
        )
    }

    /// Current central version of a document.
    pub fn document(&self, collection: &str, document_id: &str) -> Option<Value> {
        self.context.log.document(collection, document_id)
    }

    /// Returns the number of logged changes.
    pub fn change_count(&self) -> usize {
        self.context.log.len()
    }

    /// Returns the change log.
    pub fn log(&self) -> &Arc<ChangeLog> {
        &self.context.log
    }
}

impl Default for CentralServer {
    fn default() -> Self {
        Self::new(CentralConfig::default())
    }
}
