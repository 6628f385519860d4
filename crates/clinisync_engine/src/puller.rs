//! Pull phase: fetches central changes since the watermark and applies them.

use crate::applier::Applier;
use crate::config::SyncConfig;
use crate::pusher::with_timeout;
use crate::queue::SyncQueue;
use crate::transport::CentralTransport;
use chrono::{DateTime, Utc};
use clinisync_protocol::{PullRequest, RemoteChange};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Summary of one pull phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Pages fetched.
    pub pages: u32,
    /// Changes received.
    pub received: usize,
    /// Changes applied.
    pub applied: usize,
    /// Changes that failed to apply.
    pub failed: usize,
    /// Watermark after the phase.
    pub watermark: Option<DateTime<Utc>>,
    /// Whether fetching a page failed.
    pub fetch_failed: bool,
}

/// Pulls central changes page by page.
pub struct Puller {
    node_id: String,
    transport: Arc<dyn CentralTransport>,
    queue: Arc<SyncQueue>,
    applier: Applier,
    page_size: u32,
    max_pages: u32,
    timeout: Duration,
}

impl Puller {
    /// Creates a puller.
    pub fn new(
        config: &SyncConfig,
        transport: Arc<dyn CentralTransport>,
        queue: Arc<SyncQueue>,
        applier: Applier,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            transport,
            queue,
            applier,
            page_size: config.pull_page_size,
            max_pages: config.max_pull_pages.max(1),
            timeout: config.timeouts.pull,
        }
    }

    /// Runs one pull phase.
    ///
    /// A page moves the watermark to central's timestamp only when at least
    /// one change applied and none failed. Further pages are fetched while
    /// central reports more and the watermark keeps moving.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn run(&self) -> PullReport {
        let mut report = PullReport {
            watermark: self.queue.watermark(),
            ..PullReport::default()
        };

        while report.pages < self.max_pages {
            let since = self.queue.watermark();
            let request = PullRequest::new(&self.node_id, since, self.page_size);
            let page = match with_timeout(self.timeout, self.transport.pull(&request)).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, since = ?since, "pull failed");
                    report.fetch_failed = true;
                    break;
                }
            };
            report.pages += 1;
            report.received += page.changes.len();

            let (applied, failed) = self.apply_page(&page.changes);
            report.applied += applied;
            report.failed += failed;

            let moves_forward = since.map_or(true, |w| page.timestamp > w);
            let advanced = applied > 0 && failed == 0 && moves_forward;
            if advanced {
                if let Err(e) = self.queue.set_watermark(page.timestamp) {
                    error!(error = %e, "failed to persist watermark");
                    break;
                }
                report.watermark = Some(page.timestamp);
            } else if failed > 0 {
                warn!(
                    applied,
                    failed,
                    watermark = ?since,
                    "pull page had failures, watermark held"
                );
            }

            if !(page.has_more && advanced) {
                break;
            }
        }

        if report.received > 0 {
            info!(
                pages = report.pages,
                applied = report.applied,
                failed = report.failed,
                watermark = ?report.watermark,
                "pull phase finished"
            );
        } else {
            debug!("pull phase found no changes");
        }
        report
    }

    fn apply_page(&self, changes: &[RemoteChange]) -> (usize, usize) {
        let mut applied = 0;
        let mut failed = 0;
        for change in changes {
            match self.applier.apply(change) {
                Ok(_) => applied += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        collection = %change.collection,
                        document_id = %change.document_id,
                        operation = %change.operation,
                        error = %e,
                        "failed to apply remote change"
                    );
                }
            }
        }
        (applied, failed)
    }
}
