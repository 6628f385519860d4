//! Conflict resolution.

use crate::applier::Applier;
use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::queue::SyncQueue;
use clinisync_protocol::{
    document_timestamp, ConflictDecision, ConflictStrategy, Operation, RemoteChange, SyncId,
    SyncOrigin, SyncRecord, SyncStatus,
};
use std::sync::Arc;
use tracing::{info, warn};

/// What happened to a conflicting record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Central's version was applied locally and the record is synced.
    CentralApplied,
    /// The local version was re-queued for a forced push.
    LocalRequeued,
    /// The record stays in `conflict` for an operator.
    Held,
}

/// Settles conflicts with the engine-wide strategy.
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    queue: Arc<SyncQueue>,
    applier: Applier,
    clock: Arc<dyn Clock>,
}

impl ConflictResolver {
    /// Creates a resolver.
    pub fn new(
        strategy: ConflictStrategy,
        queue: Arc<SyncQueue>,
        applier: Applier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            strategy,
            queue,
            applier,
            clock,
        }
    }

    /// Strategy in use.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Resolves a record that sits in `conflict` with the configured strategy.
    pub fn resolve(&self, conflicted: &SyncRecord) -> SyncResult<ResolutionOutcome> {
        let decision = self
            .strategy
            .decide(conflicted, conflicted.conflict.central_version.as_ref());
        self.settle(conflicted, decision)
    }

    /// Applies an operator's decision to a conflicting record.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] if the record is not in
    /// `conflict`.
    pub fn resolve_with(
        &self,
        id: &SyncId,
        decision: ConflictDecision,
    ) -> SyncResult<ResolutionOutcome> {
        let record = self.queue.get(id).ok_or(SyncError::NotFound(*id))?;
        if record.status != SyncStatus::Conflict {
            return Err(SyncError::InvalidStateTransition {
                from: record.status,
                to: SyncStatus::Synced,
            });
        }
        self.settle(&record, decision)
    }

    /// Retries every conflict that has no resolution yet.
    ///
    /// A conflict stays unresolved when applying central's version failed
    /// earlier. Returns how many records were settled.
    pub fn resolve_outstanding(&self) -> usize {
        let unresolved: Vec<SyncRecord> = self
            .queue
            .list(Some(SyncStatus::Conflict), usize::MAX)
            .into_iter()
            .filter(|r| r.conflict.resolution.is_none())
            .collect();

        let mut settled = 0;
        for record in unresolved {
            match self.resolve(&record) {
                Ok(ResolutionOutcome::Held) => {}
                Ok(_) => settled += 1,
                Err(e) => warn!(
                    sync_id = %record.sync_id,
                    collection = %record.collection,
                    document_id = %record.document_id,
                    error = %e,
                    "conflict resolution failed"
                ),
            }
        }
        settled
    }

    fn settle(
        &self,
        record: &SyncRecord,
        decision: ConflictDecision,
    ) -> SyncResult<ResolutionOutcome> {
        info!(
            sync_id = %record.sync_id,
            collection = %record.collection,
            document_id = %record.document_id,
            strategy = %self.strategy,
            decision = ?decision,
            "resolving conflict"
        );

        match decision {
            ConflictDecision::ApplyCentral => {
                self.applier.apply(&self.central_change(record))?;
                self.queue.mark_synced(record, SyncOrigin::CentralWins)?;
                Ok(ResolutionOutcome::CentralApplied)
            }
            ConflictDecision::RepushLocal => {
                self.queue.requeue_local_wins(record)?;
                Ok(ResolutionOutcome::LocalRequeued)
            }
            ConflictDecision::Hold => {
                if record.conflict.resolution != Some(decision.resolution()) {
                    self.queue.hold_conflict(record)?;
                }
                Ok(ResolutionOutcome::Held)
            }
        }
    }

    /// Builds the change that materializes central's version locally.
    ///
    /// A missing central version means central deleted the document.
    fn central_change(&self, record: &SyncRecord) -> RemoteChange {
        let central = record.conflict.central_version.clone();
        let changed_at = central
            .as_ref()
            .and_then(document_timestamp)
            .unwrap_or_else(|| self.clock.now());
        RemoteChange {
            collection: record.collection.clone(),
            document_id: record.document_id.clone(),
            operation: if central.is_some() {
                Operation::Update
            } else {
                Operation::Delete
            },
            data: central,
            changed_at,
        }
    }
}
