//! Push phase: drains due records to central.

use crate::config::{SyncConfig, Timeouts};
use crate::error::{SyncError, SyncResult};
use crate::queue::SyncQueue;
use crate::resolver::{ConflictResolver, ResolutionOutcome};
use crate::transport::CentralTransport;
use clinisync_protocol::{
    ConflictResolution, PushItem, PushRequest, PushResponse, SyncId, SyncOrigin, SyncRecord,
    SyncStatus,
};
use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of pushing a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Central accepted the record.
    Synced,
    /// Central reported a conflict; `None` when resolution failed and will
    /// be retried on a later cycle.
    Conflict(Option<ResolutionOutcome>),
    /// The attempt failed and the record was rescheduled or dead-lettered.
    Failed {
        /// Whether the retry budget is now exhausted.
        dead_lettered: bool,
    },
    /// The record changed before it could be claimed.
    Skipped,
}

/// Summary of one push phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Whether central answered the liveness probe.
    pub online: bool,
    /// Records claimed and transmitted.
    pub attempted: usize,
    /// Records accepted.
    pub synced: usize,
    /// Conflicts reported by central.
    pub conflicts: usize,
    /// Failed attempts.
    pub failed: usize,
    /// Records moved to dead letter.
    pub dead_lettered: usize,
    /// Records skipped because they changed before the claim.
    pub skipped: usize,
    /// Earlier conflicts settled at the start of the phase.
    pub resolved: usize,
}

impl PushReport {
    fn record(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Skipped => {
                self.skipped += 1;
                return;
            }
            PushOutcome::Synced => self.synced += 1,
            PushOutcome::Conflict(_) => self.conflicts += 1,
            PushOutcome::Failed { dead_lettered } => {
                self.failed += 1;
                if dead_lettered {
                    self.dead_lettered += 1;
                }
            }
        }
        self.attempted += 1;
    }
}

/// Pushes pending records with bounded concurrency.
pub struct Pusher {
    node_id: String,
    transport: Arc<dyn CentralTransport>,
    queue: Arc<SyncQueue>,
    resolver: Arc<ConflictResolver>,
    concurrency: usize,
    batch_limit: usize,
    batch_delay: Duration,
    request_retries: u32,
    request_retry_delay: Duration,
    timeouts: Timeouts,
}

impl Pusher {
    /// Creates a pusher.
    pub fn new(
        config: &SyncConfig,
        transport: Arc<dyn CentralTransport>,
        queue: Arc<SyncQueue>,
        resolver: Arc<ConflictResolver>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            transport,
            queue,
            resolver,
            concurrency: config.push_concurrency.max(1),
            batch_limit: config.push_batch_limit,
            batch_delay: config.batch_delay,
            request_retries: config.request_retries,
            request_retry_delay: config.request_retry_delay,
            timeouts: config.timeouts,
        }
    }

    /// Probes central's liveness under the health timeout.
    pub async fn probe(&self) -> SyncResult<()> {
        with_timeout(self.timeouts.health, self.transport.health()).await
    }

    /// Runs one push phase.
    ///
    /// When central does not answer the probe nothing is claimed and no
    /// attempt is consumed.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn run(&self) -> PushReport {
        let mut report = PushReport::default();
        if let Err(e) = self.probe().await {
            warn!(error = %e, "central unreachable, skipping push phase");
            return report;
        }
        report.online = true;
        report.resolved = self.resolver.resolve_outstanding();

        // Due records are fetched per batch so a record held back by an older
        // one of the same document goes out once that one is synced. Each
        // record is tried at most once per phase.
        let mut tried: HashSet<SyncId> = HashSet::new();
        let mut budget = self.batch_limit;
        while budget > 0 {
            let batch: Vec<SyncRecord> = self
                .queue
                .get_pending(&self.node_id, budget + tried.len())
                .into_iter()
                .filter(|r| !tried.contains(&r.sync_id))
                .take(self.concurrency.min(budget))
                .collect();
            if batch.is_empty() {
                break;
            }
            if !tried.is_empty() && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            debug!(batch = batch.len(), budget, "pushing records");

            budget -= batch.len();
            tried.extend(batch.iter().map(|r| r.sync_id));
            for outcome in join_all(batch.iter().map(|r| self.push_record(r))).await {
                report.record(outcome);
            }
        }
        if tried.is_empty() {
            return report;
        }

        info!(
            attempted = report.attempted,
            synced = report.synced,
            conflicts = report.conflicts,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "push phase finished"
        );
        report
    }

    /// Claims and pushes one record, recording the outcome in the queue.
    pub async fn push_record(&self, snapshot: &SyncRecord) -> PushOutcome {
        let claimed = match self.queue.claim(snapshot) {
            Ok(record) => record,
            Err(e) => {
                debug!(sync_id = %snapshot.sync_id, error = %e, "record not claimable");
                return PushOutcome::Skipped;
            }
        };

        let force = claimed.conflict.resolution == Some(ConflictResolution::LocalWins);
        let request = PushRequest::new(&self.node_id, PushItem::from_record(&claimed, force));

        match self.transmit(&request).await {
            Ok(response) if response.is_conflict() => self.on_conflict(&claimed, response),
            Ok(_) => match self.queue.mark_synced(&claimed, SyncOrigin::Pushed) {
                Ok(_) => PushOutcome::Synced,
                Err(e) => {
                    error!(sync_id = %claimed.sync_id, error = %e, "failed to record push");
                    PushOutcome::Skipped
                }
            },
            Err(err) => match self.queue.mark_failed(&claimed, &err) {
                Ok(record) => PushOutcome::Failed {
                    dead_lettered: record.status == SyncStatus::DeadLetter,
                },
                Err(e) => {
                    error!(sync_id = %claimed.sync_id, error = %e, "failed to record failure");
                    PushOutcome::Skipped
                }
            },
        }
    }

    fn on_conflict(&self, claimed: &SyncRecord, response: PushResponse) -> PushOutcome {
        let central = response.conflict.and_then(|c| c.central_version);
        let conflicted = match self.queue.mark_conflict(claimed, central) {
            Ok(record) => record,
            Err(e) => {
                error!(sync_id = %claimed.sync_id, error = %e, "failed to record conflict");
                return PushOutcome::Skipped;
            }
        };

        match self.resolver.resolve(&conflicted) {
            Ok(outcome) => PushOutcome::Conflict(Some(outcome)),
            Err(e) => {
                warn!(
                    sync_id = %conflicted.sync_id,
                    collection = %conflicted.collection,
                    document_id = %conflicted.document_id,
                    error = %e,
                    "conflict left unresolved"
                );
                PushOutcome::Conflict(None)
            }
        }
    }

    /// Sends one push, retrying transient failures within the attempt.
    async fn transmit(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        let mut retries = 0;
        loop {
            let result = with_timeout(self.timeouts.push, self.transport.push(request)).await;
            match result {
                Ok(response) => {
                    response.validate()?;
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && retries < self.request_retries => {
                    retries += 1;
                    debug!(
                        sync_id = %request.item.sync_id,
                        retry = retries,
                        error = %e,
                        "retrying push"
                    );
                    let delay = self.request_retry_delay.saturating_mul(retries);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Runs a central call under `limit`, mapping expiry to [`SyncError::Timeout`].
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(SyncError::Timeout))
}
