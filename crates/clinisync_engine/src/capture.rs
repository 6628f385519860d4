//! Change capture: turns local commits into queued sync records.

use crate::clock::Clock;
use crate::config::{PriorityTable, SyncConfig};
use crate::error::SyncResult;
use crate::queue::SyncQueue;
use crate::store::{ChangeEvent, SyncCollection};
use clinisync_protocol::SyncRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_LISTENER_BACKOFF: Duration = Duration::from_secs(60);

/// Outcome of a capture pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureReport {
    /// Events turned into sync records.
    pub enqueued: usize,
    /// Remote-origin events discarded.
    pub skipped: usize,
    /// Collections whose pass failed.
    pub failed_collections: usize,
}

impl CaptureReport {
    fn merge(&mut self, other: CaptureReport) {
        self.enqueued += other.enqueued;
        self.skipped += other.skipped;
        self.failed_collections += other.failed_collections;
    }
}

/// Feeds local commits of every registered collection into the queue.
pub struct ChangeCapture {
    node_id: String,
    queue: Arc<SyncQueue>,
    collections: Vec<Arc<dyn SyncCollection>>,
    priorities: PriorityTable,
    batch_size: usize,
    poll_interval: Duration,
    clock: Arc<dyn Clock>,
    // One pass per collection at a time, so a cursor is never read twice.
    passes: HashMap<String, Mutex<()>>,
}

impl ChangeCapture {
    /// Creates a capture over `collections`.
    pub fn new(
        config: &SyncConfig,
        queue: Arc<SyncQueue>,
        collections: Vec<Arc<dyn SyncCollection>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let passes = collections
            .iter()
            .map(|c| (c.name().to_string(), Mutex::new(())))
            .collect();
        Self {
            node_id: config.node_id.clone(),
            queue,
            collections,
            priorities: config.priorities.clone(),
            batch_size: config.capture_batch_size.max(1),
            poll_interval: config.capture_poll_interval,
            clock,
            passes,
        }
    }

    /// Processes every event currently available in every collection.
    ///
    /// A failing collection is logged and counted; the others still run.
    pub fn capture_once(&self) -> CaptureReport {
        let mut report = CaptureReport::default();
        for collection in &self.collections {
            match self.capture_collection(collection.as_ref()) {
                Ok(r) => report.merge(r),
                Err(e) => {
                    warn!(collection = collection.name(), error = %e, "change capture failed");
                    report.failed_collections += 1;
                }
            }
        }
        report
    }

    /// Processes every event currently available in one collection.
    ///
    /// Each batch is journaled in one write: its records first, then the
    /// cursor past its last event. A crash can re-deliver a batch but never
    /// loses one.
    pub fn capture_collection(&self, collection: &dyn SyncCollection) -> SyncResult<CaptureReport> {
        let name = collection.name();
        let _pass = self.passes.get(name).map(|m| m.lock());
        let mut report = CaptureReport::default();

        loop {
            let cursor = self.queue.capture_cursor(name);
            let events = collection.changes_since(cursor, self.batch_size)?;
            let Some(last) = events.last().map(|e| e.sequence) else {
                break;
            };

            let mut records = Vec::with_capacity(events.len());
            for event in &events {
                if event.is_remote_origin() {
                    debug!(
                        collection = name,
                        document_id = %event.document_id,
                        sequence = event.sequence,
                        "skipping remote-origin commit"
                    );
                    report.skipped += 1;
                } else {
                    records.push(self.record_for(event));
                }
            }
            report.enqueued += self.queue.enqueue_captured(name, records, last)?.len();
        }

        if report.enqueued > 0 {
            debug!(
                collection = name,
                enqueued = report.enqueued,
                skipped = report.skipped,
                "captured local changes"
            );
        }
        Ok(report)
    }

    /// Spawns one supervised listener task per collection.
    ///
    /// Listeners never exit on error; they back off and retry until `cancel`
    /// fires. Capture passes run on the blocking pool since every batch ends
    /// in a journal sync.
    pub fn spawn_listeners(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.collections
            .iter()
            .map(|collection| {
                let capture = Arc::clone(self);
                let collection = Arc::clone(collection);
                let cancel = cancel.clone();
                tokio::spawn(async move { capture.listen(collection, cancel).await })
            })
            .collect()
    }

    /// Runs [`capture_once`](Self::capture_once) on the blocking pool.
    pub async fn capture_once_blocking(self: &Arc<Self>) -> CaptureReport {
        let capture = Arc::clone(self);
        match tokio::task::spawn_blocking(move || capture.capture_once()).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "change capture task aborted");
                CaptureReport {
                    failed_collections: self.collections.len(),
                    ..CaptureReport::default()
                }
            }
        }
    }

    async fn listen(self: Arc<Self>, collection: Arc<dyn SyncCollection>, cancel: CancellationToken) {
        let mut commits = collection.commits();
        let mut feed_open = true;
        let mut failures = 0u32;
        info!(collection = collection.name(), "change listener started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let capture = Arc::clone(&self);
            let feed = Arc::clone(&collection);
            let pass =
                tokio::task::spawn_blocking(move || capture.capture_collection(feed.as_ref()));
            let failure = match pass.await {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(format!("capture task aborted: {e}")),
            };

            if let Some(message) = failure {
                failures += 1;
                let delay = self.listener_backoff(failures);
                warn!(
                    collection = collection.name(),
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %message,
                    "change listener failed"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            failures = 0;

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = commits.changed(), if feed_open => {
                    if changed.is_err() {
                        feed_open = false;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(collection = collection.name(), "change listener stopped");
    }

    fn listener_backoff(&self, failures: u32) -> Duration {
        let base = self.poll_interval.max(Duration::from_millis(100));
        base.saturating_mul(1u32 << failures.saturating_sub(1).min(16))
            .min(MAX_LISTENER_BACKOFF)
    }

    fn record_for(&self, event: &ChangeEvent) -> SyncRecord {
        let mut record = SyncRecord::new(
            self.node_id.clone(),
            event.operation,
            event.collection.clone(),
            event.document_id.clone(),
            event.document.clone(),
            event.changed_at,
        )
        .with_priority(self.priorities.priority_of(&event.collection))
        .with_changed_fields(event.changed_fields.clone());
        record.changed_by = event.changed_by.clone();
        // Due from the moment it was captured, even if the commit is older.
        record.next_attempt_at = record.next_attempt_at.min(self.clock.now());
        record
    }
}
