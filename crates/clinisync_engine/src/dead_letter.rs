//! Operator access to dead-lettered records.

use crate::error::{SyncError, SyncResult};
use crate::queue::{QueueStats, SyncQueue};
use clinisync_protocol::{SyncId, SyncRecord, SyncStatus};
use std::sync::Arc;
use tracing::{info, warn};

const RETRY_NOTE: &str = "manual retry requested";

/// Lists, retries and purges records whose retry budget ran out.
#[derive(Clone)]
pub struct DeadLetterManager {
    queue: Arc<SyncQueue>,
}

impl DeadLetterManager {
    /// Creates a manager over `queue`.
    pub fn new(queue: Arc<SyncQueue>) -> Self {
        Self { queue }
    }

    /// Dead-lettered records, oldest first.
    pub fn list(&self, limit: usize) -> Vec<SyncRecord> {
        self.queue.list(Some(SyncStatus::DeadLetter), limit)
    }

    /// Sends one record back to `pending` with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] for unknown ids and
    /// [`SyncError::InvalidStateTransition`] if the record is not
    /// dead-lettered.
    pub fn retry_one(&self, id: &SyncId) -> SyncResult<SyncRecord> {
        self.queue.reset_for_retry(id, RETRY_NOTE)
    }

    /// Sends every dead-lettered record back to `pending`.
    ///
    /// Returns how many records were reset.
    pub fn retry_all(&self) -> SyncResult<usize> {
        let mut reset = 0;
        for record in self.list(usize::MAX) {
            match self.queue.reset_for_retry(&record.sync_id, RETRY_NOTE) {
                Ok(_) => reset += 1,
                // Someone else retried or purged it meanwhile.
                Err(SyncError::StaleRecord { .. } | SyncError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(reset, "dead letters reset for retry");
        Ok(reset)
    }

    /// Deletes dead-lettered records. Ids of records in any other status are
    /// ignored.
    ///
    /// Returns how many records were deleted.
    pub fn purge(&self, ids: &[SyncId]) -> SyncResult<usize> {
        let (dead, other): (Vec<SyncId>, Vec<SyncId>) = ids.iter().partition(|id| {
            self.queue
                .get(id)
                .is_some_and(|r| r.status == SyncStatus::DeadLetter)
        });
        if !other.is_empty() {
            warn!(ignored = other.len(), "purge skipped records that are not dead-lettered");
        }

        let removed = self.queue.remove(&dead)?;
        info!(removed, "dead letters purged");
        Ok(removed)
    }

    /// Record counts grouped by status.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }
}
