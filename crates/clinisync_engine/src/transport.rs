//! Transport layer abstraction for talking to the central authority.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::Utc;
use clinisync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection to the central authority.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, mock for testing).
/// Callers apply their own timeouts.
#[async_trait]
pub trait CentralTransport: Send + Sync {
    /// Cheap liveness probe; `Ok` means central is reachable.
    async fn health(&self) -> SyncResult<()>;

    /// Pushes a single mutation.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Pulls one page of central changes.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;
}

#[async_trait]
impl<T: CentralTransport + ?Sized> CentralTransport for Arc<T> {
    async fn health(&self) -> SyncResult<()> {
        (**self).health().await
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        (**self).push(request).await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        (**self).pull(request).await
    }
}

/// Scripted outcome of a mocked push.
#[derive(Debug, Clone, PartialEq)]
pub enum MockPush {
    /// Central accepts.
    Accept,
    /// Central reports a conflict with this version.
    Conflict(Option<Value>),
    /// Central fails with a 5xx status.
    ServerError(u16),
    /// Central rejects with a 4xx status.
    Rejected(u16),
    /// The request times out.
    Timeout,
}

impl MockPush {
    fn into_result(self) -> SyncResult<PushResponse> {
        match self {
            MockPush::Accept => Ok(PushResponse::accepted()),
            MockPush::Conflict(central) => Ok(PushResponse::conflict(central)),
            MockPush::ServerError(status) => Err(SyncError::Server {
                status,
                message: "mock server error".into(),
            }),
            MockPush::Rejected(status) => Err(SyncError::Rejected {
                status,
                message: "mock rejection".into(),
            }),
            MockPush::Timeout => Err(SyncError::Timeout),
        }
    }
}

/// Scripted outcome of a mocked pull.
#[derive(Debug, Clone, PartialEq)]
pub enum MockPull {
    /// Central returns this page.
    Page(PullResponse),
    /// Central fails with a 5xx status.
    ServerError(u16),
}

/// A mock transport for testing.
///
/// Scripted outcomes are consumed in order; once a script runs out the
/// default applies (accept for pushes, an empty page for pulls).
#[derive(Debug)]
pub struct MockTransport {
    reachable: AtomicBool,
    push_script: Mutex<VecDeque<MockPush>>,
    push_default: Mutex<MockPush>,
    pull_script: Mutex<VecDeque<MockPull>>,
    push_delay: Mutex<Duration>,
    pushes: Mutex<Vec<PushRequest>>,
    pulls: Mutex<Vec<PullRequest>>,
    health_checks: AtomicUsize,
}

impl MockTransport {
    /// Creates a reachable mock that accepts every push.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            push_script: Mutex::new(VecDeque::new()),
            push_default: Mutex::new(MockPush::Accept),
            pull_script: Mutex::new(VecDeque::new()),
            push_delay: Mutex::new(Duration::ZERO),
            pushes: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
            health_checks: AtomicUsize::new(0),
        }
    }

    /// Sets whether central answers at all.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queues the outcome of the next unscripted push.
    pub fn script_push(&self, outcome: MockPush) {
        self.push_script.lock().push_back(outcome);
    }

    /// Sets the outcome used once the push script is empty.
    pub fn set_default_push(&self, outcome: MockPush) {
        *self.push_default.lock() = outcome;
    }

    /// Queues the outcome of the next pull.
    pub fn script_pull(&self, outcome: MockPull) {
        self.pull_script.lock().push_back(outcome);
    }

    /// Makes every push take `delay` before answering.
    pub fn set_push_delay(&self, delay: Duration) {
        *self.push_delay.lock() = delay;
    }

    /// Push requests received so far.
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    /// Pull requests received so far.
    pub fn pulls(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Number of liveness probes received.
    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CentralTransport for MockTransport {
    async fn health(&self) -> SyncResult<()> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if !self.is_reachable() {
            return Err(SyncError::NotConnected);
        }
        Ok(())
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let delay = *self.push_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_reachable() {
            return Err(SyncError::NotConnected);
        }

        self.pushes.lock().push(request.clone());
        let scripted = self.push_script.lock().pop_front();
        scripted
            .unwrap_or_else(|| self.push_default.lock().clone())
            .into_result()
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        if !self.is_reachable() {
            return Err(SyncError::NotConnected);
        }

        self.pulls.lock().push(request.clone());
        match self.pull_script.lock().pop_front() {
            Some(MockPull::Page(page)) => Ok(page),
            Some(MockPull::ServerError(status)) => Err(SyncError::Server {
                status,
                message: "mock server error".into(),
            }),
            None => Ok(PullResponse::new(Vec::new(), Utc::now(), false)),
        }
    }
}
