//! Durable queue of outbound sync records.
//!
//! The queue keeps every record in memory, indexed by [`SyncId`], and
//! journals each mutation as a CBOR frame before the index changes. Opening
//! a queue replays the journal; records left in `syncing` by a crash go back
//! to `pending`.
//!
//! Record mutations take the caller's snapshot of the record and only apply
//! if the stored record still has the same status and attempt count.
//!
//! The journal is rewritten to the live state once it holds many more frames
//! than that state needs.
//!
//! Records of one document are pushed in enqueue order: a record is not
//! handed out or claimed while an older record of the same document is
//! pending, syncing or in conflict.

use crate::clock::{add_duration, Clock};
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use clinisync_protocol::{
    ConflictInfo, ConflictResolution, ErrorEntry, SyncId, SyncOrigin, SyncRecord, SyncStatus,
};
use clinisync_storage::{FileBackend, InMemoryBackend, Journal, StorageBackend};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Journals shorter than this are never compacted.
const COMPACT_MIN_FRAMES: u64 = 1024;
/// Compact once the journal holds this many frames per live entry.
const COMPACT_RATIO: u64 = 4;

/// One journaled queue mutation.
#[derive(Debug, Serialize, Deserialize)]
enum JournalEntry {
    Put(Box<SyncRecord>),
    Remove(Vec<SyncId>),
    Watermark(DateTime<Utc>),
    Cursor { collection: String, sequence: u64 },
    NextSequence(u64),
}

/// Record counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Waiting to be pushed.
    pub pending: usize,
    /// Claimed by the pusher.
    pub syncing: usize,
    /// Accepted by central.
    pub synced: usize,
    /// Waiting for conflict resolution.
    pub conflict: usize,
    /// Retry budget exhausted.
    pub dead_letter: usize,
}

impl QueueStats {
    /// Count for one status.
    pub fn count(&self, status: SyncStatus) -> usize {
        match status {
            SyncStatus::Pending => self.pending,
            SyncStatus::Syncing => self.syncing,
            SyncStatus::Synced => self.synced,
            SyncStatus::Conflict => self.conflict,
            SyncStatus::DeadLetter => self.dead_letter,
        }
    }

    /// Total number of records.
    pub fn total(&self) -> usize {
        SyncStatus::ALL.iter().map(|s| self.count(*s)).sum()
    }

    fn add(&mut self, status: SyncStatus) {
        match status {
            SyncStatus::Pending => self.pending += 1,
            SyncStatus::Syncing => self.syncing += 1,
            SyncStatus::Synced => self.synced += 1,
            SyncStatus::Conflict => self.conflict += 1,
            SyncStatus::DeadLetter => self.dead_letter += 1,
        }
    }
}

/// Statuses that hold back later records of the same document.
fn holds_document(status: SyncStatus) -> bool {
    matches!(
        status,
        SyncStatus::Pending | SyncStatus::Syncing | SyncStatus::Conflict
    )
}

struct QueueInner {
    journal: Journal<Box<dyn StorageBackend>>,
    records: HashMap<SyncId, SyncRecord>,
    watermark: Option<DateTime<Utc>>,
    cursors: HashMap<String, u64>,
    next_sequence: u64,
}

impl QueueInner {
    fn append(&mut self, entry: &JournalEntry) -> SyncResult<()> {
        self.journal.append(&encode(entry)?)?;
        Ok(())
    }

    fn put(&mut self, record: SyncRecord) -> SyncResult<SyncRecord> {
        self.append(&JournalEntry::Put(Box::new(record.clone())))?;
        self.records.insert(record.sync_id, record.clone());
        self.maybe_compact();
        Ok(record)
    }

    /// Frames needed to describe the current state.
    fn live_frames(&self) -> u64 {
        (self.records.len() + self.cursors.len() + 2) as u64
    }

    /// Compacts when the journal has grown well past the live state.
    ///
    /// Runs after the index is updated. A failed compaction leaves the old
    /// journal in place and is only logged.
    fn maybe_compact(&mut self) {
        let frames = self.journal.frame_count();
        if frames < COMPACT_MIN_FRAMES || frames <= self.live_frames() * COMPACT_RATIO {
            return;
        }
        if let Err(e) = self.compact() {
            warn!(frames, error = %e, "sync journal compaction failed");
        }
    }

    /// Rewrites the journal as one frame per live entry.
    fn compact(&mut self) -> SyncResult<()> {
        let before = self.journal.frame_count();

        let mut entries = vec![JournalEntry::NextSequence(self.next_sequence)];
        if let Some(watermark) = self.watermark {
            entries.push(JournalEntry::Watermark(watermark));
        }
        let mut cursors: Vec<(&String, &u64)> = self.cursors.iter().collect();
        cursors.sort();
        entries.extend(cursors.into_iter().map(|(collection, sequence)| {
            JournalEntry::Cursor {
                collection: collection.clone(),
                sequence: *sequence,
            }
        }));
        let mut records: Vec<&SyncRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.sequence);
        entries.extend(
            records
                .into_iter()
                .map(|r| JournalEntry::Put(Box::new(r.clone()))),
        );

        let frames = entries
            .iter()
            .map(encode)
            .collect::<SyncResult<Vec<_>>>()?;
        self.journal.rewrite(&frames)?;

        info!(
            before,
            after = self.journal.frame_count(),
            records = self.records.len(),
            "compacted sync journal"
        );
        Ok(())
    }

    /// Oldest unsettled record of the same document that precedes `record`.
    fn older_unsettled(&self, record: &SyncRecord) -> Option<&SyncRecord> {
        self.records
            .values()
            .filter(|r| {
                r.sequence < record.sequence
                    && holds_document(r.status)
                    && r.node_id == record.node_id
                    && r.collection == record.collection
                    && r.document_id == record.document_id
            })
            .min_by_key(|r| r.sequence)
    }

    fn replay(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Put(record) => {
                self.next_sequence = self.next_sequence.max(record.sequence + 1);
                self.records.insert(record.sync_id, *record);
            }
            JournalEntry::Remove(ids) => {
                for id in ids {
                    self.records.remove(&id);
                }
            }
            JournalEntry::Watermark(ts) => self.watermark = Some(ts),
            JournalEntry::Cursor {
                collection,
                sequence,
            } => {
                self.cursors.insert(collection, sequence);
            }
            JournalEntry::NextSequence(next) => {
                self.next_sequence = self.next_sequence.max(next);
            }
        }
    }
}

fn encode(entry: &JournalEntry) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(entry, &mut bytes)?;
    Ok(bytes)
}

/// Durable store of sync records, the watermark and capture cursors.
pub struct SyncQueue {
    inner: RwLock<QueueInner>,
    retry: RetryConfig,
    error_history_cap: usize,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    /// Opens a queue over `backend`, replaying its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or an intact frame
    /// does not decode.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        retry: RetryConfig,
        error_history_cap: usize,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let (journal, replay) = Journal::open(backend)?;
        if replay.discarded_bytes > 0 {
            warn!(
                discarded_bytes = replay.discarded_bytes,
                "discarded torn tail of sync journal"
            );
        }

        let mut inner = QueueInner {
            journal,
            records: HashMap::new(),
            watermark: None,
            cursors: HashMap::new(),
            next_sequence: 0,
        };
        for frame in &replay.frames {
            let entry: JournalEntry = ciborium::de::from_reader(frame.as_slice())?;
            inner.replay(entry);
        }

        let inflight: Vec<SyncRecord> = inner
            .records
            .values()
            .filter(|r| r.status == SyncStatus::Syncing)
            .cloned()
            .collect();
        let recovered = inflight.len();
        for mut record in inflight {
            warn!(
                sync_id = %record.sync_id,
                collection = %record.collection,
                "recovering inflight sync record"
            );
            record.status = SyncStatus::Pending;
            inner.put(record)?;
        }
        inner.maybe_compact();

        info!(
            records = inner.records.len(),
            frames = replay.frames.len(),
            recovered,
            "sync queue opened"
        );

        Ok(Self {
            inner: RwLock::new(inner),
            retry,
            error_history_cap,
            clock,
        })
    }

    /// Opens a queue journaled to a file, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or replayed.
    pub fn open_file(
        path: impl AsRef<Path>,
        retry: RetryConfig,
        error_history_cap: usize,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path.as_ref())?;
        Self::open(Box::new(backend), retry, error_history_cap, clock)
    }

    /// Creates an empty queue held in memory.
    pub fn in_memory(
        retry: RetryConfig,
        error_history_cap: usize,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        Self::open(
            Box::new(InMemoryBackend::new()),
            retry,
            error_history_cap,
            clock,
        )
    }

    /// Retry settings used by [`mark_failed`](Self::mark_failed).
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Adds a new record, assigning its queue sequence.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DuplicateSyncId`] if the id is already queued.
    pub fn enqueue(&self, mut record: SyncRecord) -> SyncResult<SyncRecord> {
        let mut inner = self.inner.write();
        if inner.records.contains_key(&record.sync_id) {
            return Err(SyncError::DuplicateSyncId(record.sync_id));
        }

        record.sequence = inner.next_sequence;
        let record = inner.put(record)?;
        inner.next_sequence += 1;

        debug!(
            sync_id = %record.sync_id,
            collection = %record.collection,
            document_id = %record.document_id,
            operation = %record.operation,
            priority = record.priority,
            "enqueued sync record"
        );
        Ok(record)
    }

    /// Adds captured records and moves the capture cursor of `collection`
    /// to `cursor`, all in one durable journal write.
    ///
    /// Records are journaled ahead of the cursor, so a torn write can only
    /// lose the cursor move and re-deliver the batch.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DuplicateSyncId`] if an id is already queued.
    pub fn enqueue_captured(
        &self,
        collection: &str,
        records: Vec<SyncRecord>,
        cursor: u64,
    ) -> SyncResult<Vec<SyncRecord>> {
        let mut inner = self.inner.write();
        if let Some(dup) = records.iter().find(|r| inner.records.contains_key(&r.sync_id)) {
            return Err(SyncError::DuplicateSyncId(dup.sync_id));
        }

        let mut next = inner.next_sequence;
        let records: Vec<SyncRecord> = records
            .into_iter()
            .map(|mut record| {
                record.sequence = next;
                next += 1;
                record
            })
            .collect();

        let mut entries: Vec<JournalEntry> = records
            .iter()
            .map(|r| JournalEntry::Put(Box::new(r.clone())))
            .collect();
        let cursor_moves = inner.cursors.get(collection) != Some(&cursor);
        if cursor_moves {
            entries.push(JournalEntry::Cursor {
                collection: collection.to_string(),
                sequence: cursor,
            });
        }
        let frames = entries
            .iter()
            .map(encode)
            .collect::<SyncResult<Vec<_>>>()?;
        inner.journal.append_all(&frames)?;

        inner.next_sequence = next;
        for record in &records {
            inner.records.insert(record.sync_id, record.clone());
        }
        if cursor_moves {
            inner.cursors.insert(collection.to_string(), cursor);
        }
        inner.maybe_compact();

        if !records.is_empty() {
            debug!(collection, count = records.len(), cursor, "enqueued captured records");
        }
        Ok(records)
    }

    /// Returns a record by id.
    pub fn get(&self, id: &SyncId) -> Option<SyncRecord> {
        self.inner.read().records.get(id).cloned()
    }

    /// Pending records of `node_id` that are due, most urgent first.
    ///
    /// Ordered by priority, then capture time, then enqueue order. Only the
    /// oldest unsettled record of each document is eligible; later ones wait
    /// until it is synced or dead-lettered.
    pub fn get_pending(&self, node_id: &str, limit: usize) -> Vec<SyncRecord> {
        let now = self.clock.now();
        let inner = self.inner.read();

        let mut heads: HashMap<(&str, &str), u64> = HashMap::new();
        for r in inner.records.values() {
            if r.node_id == node_id && holds_document(r.status) {
                heads
                    .entry((r.collection.as_str(), r.document_id.as_str()))
                    .and_modify(|seq| *seq = (*seq).min(r.sequence))
                    .or_insert(r.sequence);
            }
        }

        let mut due: Vec<&SyncRecord> = inner
            .records
            .values()
            .filter(|r| {
                r.status == SyncStatus::Pending && r.node_id == node_id && r.next_attempt_at <= now
            })
            .filter(|r| {
                let key = (r.collection.as_str(), r.document_id.as_str());
                heads.get(&key) == Some(&r.sequence)
            })
            .collect();
        due.sort_by_key(|r| (r.priority, r.changed_at, r.sequence));
        due.into_iter().take(limit).cloned().collect()
    }

    /// Records with a given status (or all), in enqueue order.
    pub fn list(&self, status: Option<SyncStatus>, limit: usize) -> Vec<SyncRecord> {
        let inner = self.inner.read();
        let mut records: Vec<&SyncRecord> = inner
            .records
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .collect();
        records.sort_by_key(|r| r.sequence);
        records.into_iter().take(limit).cloned().collect()
    }

    /// Counts records per status.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.read();
        let mut stats = QueueStats::default();
        for record in inner.records.values() {
            stats.add(record.status);
        }
        stats
    }

    /// Number of records, terminal ones included.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Returns true if the queue holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves a pending record to `syncing`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::StaleRecord`] if someone else claimed or changed
    /// the record since `snapshot` was read, and [`SyncError::OutOfOrder`]
    /// while an older record of the same document is unsettled.
    pub fn claim(&self, snapshot: &SyncRecord) -> SyncResult<SyncRecord> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        if let Some(older) = inner.older_unsettled(snapshot) {
            return Err(SyncError::OutOfOrder {
                sync_id: snapshot.sync_id,
                older: older.sync_id,
            });
        }
        Self::apply_transition(
            &mut inner,
            now,
            snapshot,
            &[SyncStatus::Pending],
            SyncStatus::Syncing,
            |_, _| {},
        )
    }

    /// Marks a record synced.
    ///
    /// From `syncing` this completes a push attempt; from `conflict` it
    /// records that the central version was applied locally.
    pub fn mark_synced(&self, snapshot: &SyncRecord, origin: SyncOrigin) -> SyncResult<SyncRecord> {
        let completes_attempt = snapshot.status == SyncStatus::Syncing;
        let record = self.transition(
            snapshot,
            &[SyncStatus::Syncing, SyncStatus::Conflict],
            SyncStatus::Synced,
            |record, now| {
                if completes_attempt {
                    record.attempts += 1;
                }
                record.synced_at = Some(now);
                record.last_origin = Some(origin);
                if origin == SyncOrigin::CentralWins {
                    record.conflict.resolution = Some(ConflictResolution::CentralWins);
                }
            },
        )?;

        info!(
            sync_id = %record.sync_id,
            collection = %record.collection,
            document_id = %record.document_id,
            attempts = record.attempts,
            origin = ?origin,
            "sync record synced"
        );
        Ok(record)
    }

    /// Records a failed attempt and schedules the next one.
    ///
    /// The record goes back to `pending` with exponential backoff, or to
    /// `dead_letter` once `max_attempts` is reached.
    pub fn mark_failed(&self, snapshot: &SyncRecord, err: &SyncError) -> SyncResult<SyncRecord> {
        let attempts = snapshot.attempts + 1;
        let exhausted = attempts >= self.retry.max_attempts;
        let target = if exhausted {
            SyncStatus::DeadLetter
        } else {
            SyncStatus::Pending
        };

        let record = self.transition(
            snapshot,
            &[SyncStatus::Syncing],
            target,
            |record, now| {
                record.attempts = attempts;
                record.push_error(
                    ErrorEntry {
                        at: now,
                        attempt: attempts,
                        message: err.to_string(),
                        retryable: err.is_retryable(),
                    },
                    self.error_history_cap,
                );

                let previous = Duration::from_millis(record.backoff_ms);
                let backoff = self.retry.next_backoff(attempts, previous);
                record.backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
                record.next_attempt_at = record.next_attempt_at.max(add_duration(now, backoff));
            },
        )?;

        if exhausted {
            error!(
                sync_id = %record.sync_id,
                collection = %record.collection,
                document_id = %record.document_id,
                attempts = record.attempts,
                error = %err,
                "sync record moved to dead letter"
            );
        } else {
            warn!(
                sync_id = %record.sync_id,
                collection = %record.collection,
                attempts = record.attempts,
                backoff_ms = record.backoff_ms,
                retryable = err.is_retryable(),
                error = %err,
                "sync attempt failed"
            );
        }
        Ok(record)
    }

    /// Records that central holds a different version of the document.
    pub fn mark_conflict(
        &self,
        snapshot: &SyncRecord,
        central_version: Option<Value>,
    ) -> SyncResult<SyncRecord> {
        let record = self.transition(
            snapshot,
            &[SyncStatus::Syncing],
            SyncStatus::Conflict,
            |record, now| {
                record.attempts += 1;
                record.conflict = ConflictInfo {
                    detected: true,
                    central_version,
                    resolution: None,
                    detected_at: Some(now),
                };
            },
        )?;

        warn!(
            sync_id = %record.sync_id,
            collection = %record.collection,
            document_id = %record.document_id,
            "central reported a version conflict"
        );
        Ok(record)
    }

    /// Re-queues a conflicting record so its local version is force-pushed.
    pub fn requeue_local_wins(&self, snapshot: &SyncRecord) -> SyncResult<SyncRecord> {
        let record = self.transition(
            snapshot,
            &[SyncStatus::Conflict],
            SyncStatus::Pending,
            |record, now| {
                record.attempts = 0;
                record.backoff_ms = 0;
                record.next_attempt_at = now;
                record.conflict.resolution = Some(ConflictResolution::LocalWins);
            },
        )?;

        info!(
            sync_id = %record.sync_id,
            collection = %record.collection,
            document_id = %record.document_id,
            "local version wins, re-queued for forced push"
        );
        Ok(record)
    }

    /// Freezes a conflicting record until an operator decides.
    pub fn hold_conflict(&self, snapshot: &SyncRecord) -> SyncResult<SyncRecord> {
        let record = self.transition(
            snapshot,
            &[SyncStatus::Conflict],
            SyncStatus::Conflict,
            |record, _| {
                record.conflict.resolution = Some(ConflictResolution::Manual);
            },
        )?;

        info!(
            sync_id = %record.sync_id,
            collection = %record.collection,
            document_id = %record.document_id,
            "conflict held for manual resolution"
        );
        Ok(record)
    }

    /// Returns a dead-lettered record to `pending` with a fresh retry budget.
    ///
    /// `note` is added to the error history as an audit entry.
    pub fn reset_for_retry(&self, id: &SyncId, note: &str) -> SyncResult<SyncRecord> {
        let snapshot = self.get(id).ok_or(SyncError::NotFound(*id))?;
        let record = self.transition(
            &snapshot,
            &[SyncStatus::DeadLetter],
            SyncStatus::Pending,
            |record, now| {
                record.attempts = 0;
                record.backoff_ms = 0;
                record.next_attempt_at = now;
                record.push_error(
                    ErrorEntry {
                        at: now,
                        attempt: 0,
                        message: note.to_string(),
                        retryable: true,
                    },
                    self.error_history_cap,
                );
            },
        )?;

        info!(
            sync_id = %record.sync_id,
            collection = %record.collection,
            "dead letter reset for retry"
        );
        Ok(record)
    }

    /// Deletes records by id, returning how many existed.
    pub fn remove(&self, ids: &[SyncId]) -> SyncResult<usize> {
        let mut inner = self.inner.write();
        let present: Vec<SyncId> = ids
            .iter()
            .filter(|id| inner.records.contains_key(id))
            .copied()
            .collect();
        if present.is_empty() {
            return Ok(0);
        }

        inner.append(&JournalEntry::Remove(present.clone()))?;
        for id in &present {
            inner.records.remove(id);
        }
        inner.maybe_compact();
        debug!(count = present.len(), "removed sync records");
        Ok(present.len())
    }

    /// The pull watermark, if any pull has completed.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.inner.read().watermark
    }

    /// Persists a new pull watermark.
    pub fn set_watermark(&self, watermark: DateTime<Utc>) -> SyncResult<()> {
        let mut inner = self.inner.write();
        if inner.watermark == Some(watermark) {
            return Ok(());
        }
        inner.append(&JournalEntry::Watermark(watermark))?;
        inner.watermark = Some(watermark);
        inner.maybe_compact();
        Ok(())
    }

    /// Last feed sequence of `collection` that capture has processed.
    pub fn capture_cursor(&self, collection: &str) -> u64 {
        self.inner
            .read()
            .cursors
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    /// Persists the capture cursor of `collection`.
    pub fn set_capture_cursor(&self, collection: &str, sequence: u64) -> SyncResult<()> {
        let mut inner = self.inner.write();
        if inner.cursors.get(collection) == Some(&sequence) {
            return Ok(());
        }
        inner.append(&JournalEntry::Cursor {
            collection: collection.to_string(),
            sequence,
        })?;
        inner.cursors.insert(collection.to_string(), sequence);
        inner.maybe_compact();
        Ok(())
    }

    /// Rewrites the journal to one frame per live entry.
    ///
    /// Happens on its own once the journal outgrows the live state; this
    /// forces it, e.g. after purging dead letters.
    ///
    /// # Errors
    ///
    /// Returns an error if the new journal cannot be written; the old one is
    /// then left untouched.
    pub fn compact(&self) -> SyncResult<()> {
        self.inner.write().compact()
    }

    /// Number of frames in the backing journal.
    pub fn journal_frames(&self) -> u64 {
        self.inner.read().journal.frame_count()
    }

    /// Applies `mutate` and moves the record to `target` if it still matches
    /// `snapshot` and currently sits in one of `from`.
    fn transition<F>(
        &self,
        snapshot: &SyncRecord,
        from: &[SyncStatus],
        target: SyncStatus,
        mutate: F,
    ) -> SyncResult<SyncRecord>
    where
        F: FnOnce(&mut SyncRecord, DateTime<Utc>),
    {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        Self::apply_transition(&mut inner, now, snapshot, from, target, mutate)
    }

    fn apply_transition<F>(
        inner: &mut QueueInner,
        now: DateTime<Utc>,
        snapshot: &SyncRecord,
        from: &[SyncStatus],
        target: SyncStatus,
        mutate: F,
    ) -> SyncResult<SyncRecord>
    where
        F: FnOnce(&mut SyncRecord, DateTime<Utc>),
    {
        let current = inner
            .records
            .get(&snapshot.sync_id)
            .ok_or(SyncError::NotFound(snapshot.sync_id))?;

        if current.status != snapshot.status || current.attempts != snapshot.attempts {
            return Err(SyncError::StaleRecord {
                sync_id: snapshot.sync_id,
                expected: snapshot.status,
                expected_attempts: snapshot.attempts,
                actual: current.status,
                actual_attempts: current.attempts,
            });
        }

        // Holding a conflict keeps the status; every other move is a DAG edge.
        let allowed = from.contains(&current.status)
            && (current.status == target || current.status.can_transition_to(target));
        if !allowed {
            return Err(SyncError::InvalidStateTransition {
                from: current.status,
                to: target,
            });
        }

        let mut next = current.clone();
        next.status = target;
        mutate(&mut next, now);
        inner.put(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use clinisync_protocol::Operation;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(Duration::ZERO)
    }

    fn queue_with(clock: &ManualClock, max_attempts: u32) -> SyncQueue {
        SyncQueue::in_memory(retry(max_attempts), 10, Arc::new(clock.clone())).unwrap()
    }

    fn record(collection: &str, id: &str, changed_at: DateTime<Utc>) -> SyncRecord {
        SyncRecord::new(
            "clinic-1",
            Operation::Create,
            collection,
            id,
            Some(json!({"id": id})),
            changed_at,
        )
    }

    fn server_error() -> SyncError {
        SyncError::Server {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[test]
    fn enqueue_assigns_sequence_and_rejects_duplicates() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);

        let a = queue.enqueue(record("patients", "p1", start())).unwrap();
        let b = queue.enqueue(record("patients", "p2", start())).unwrap();
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);

        let err = queue.enqueue(a.clone()).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateSyncId(id) if id == a.sync_id));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pending_order_is_priority_then_time_then_sequence() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);
        let later = start() + chrono::Duration::seconds(5);

        let invoice = queue
            .enqueue(record("invoices", "i1", start()).with_priority(4))
            .unwrap();
        let late_patient = queue
            .enqueue(record("patients", "p2", later).with_priority(1))
            .unwrap();
        let patient = queue
            .enqueue(record("patients", "p1", start()).with_priority(1))
            .unwrap();
        let twin = queue
            .enqueue(record("patients", "p3", start()).with_priority(1))
            .unwrap();

        let ids: Vec<SyncId> = queue
            .get_pending("clinic-1", 10)
            .iter()
            .map(|r| r.sync_id)
            .collect();
        assert_eq!(
            ids,
            vec![patient.sync_id, twin.sync_id, late_patient.sync_id, invoice.sync_id]
        );
        assert_eq!(queue.get_pending("clinic-1", 2).len(), 2);
        assert!(queue.get_pending("clinic-2", 10).is_empty());
    }

    #[test]
    fn claim_is_compare_and_set() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);
        let pending = queue.enqueue(record("patients", "p1", start())).unwrap();

        let claimed = queue.claim(&pending).unwrap();
        assert_eq!(claimed.status, SyncStatus::Syncing);

        let err = queue.claim(&pending).unwrap_err();
        assert!(matches!(
            err,
            SyncError::StaleRecord {
                actual: SyncStatus::Syncing,
                ..
            }
        ));
        assert!(queue.get_pending("clinic-1", 10).is_empty());
    }

    #[test]
    fn later_record_waits_for_older_of_same_document() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);
        let v1 = queue.enqueue(record("patients", "p1", start())).unwrap();
        let v2 = queue
            .enqueue(record("patients", "p1", start() + chrono::Duration::seconds(1)))
            .unwrap();
        let other = queue.enqueue(record("patients", "p2", start())).unwrap();

        let ids: Vec<SyncId> = queue
            .get_pending("clinic-1", 10)
            .iter()
            .map(|r| r.sync_id)
            .collect();
        assert_eq!(ids, vec![v1.sync_id, other.sync_id]);
        assert!(matches!(
            queue.claim(&v2),
            Err(SyncError::OutOfOrder { older, .. }) if older == v1.sync_id
        ));

        // Backing off still holds the later record back.
        let claimed = queue.claim(&v1).unwrap();
        let failed = queue.mark_failed(&claimed, &server_error()).unwrap();
        clock.advance(Duration::from_secs(3600));
        let due = queue.get_pending("clinic-1", 10);
        assert!(due.iter().any(|r| r.sync_id == v1.sync_id));
        assert!(due.iter().all(|r| r.sync_id != v2.sync_id));

        let claimed = queue.claim(&failed).unwrap();
        queue.mark_synced(&claimed, SyncOrigin::Pushed).unwrap();
        let due = queue.get_pending("clinic-1", 10);
        assert!(due.iter().any(|r| r.sync_id == v2.sync_id));
        assert_eq!(queue.claim(&v2).unwrap().status, SyncStatus::Syncing);
    }

    #[test]
    fn dead_letter_releases_later_record() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 1);
        let v1 = queue.enqueue(record("patients", "p1", start())).unwrap();
        let v2 = queue.enqueue(record("patients", "p1", start())).unwrap();

        let claimed = queue.claim(&v1).unwrap();
        let dead = queue.mark_failed(&claimed, &server_error()).unwrap();
        assert_eq!(dead.status, SyncStatus::DeadLetter);

        let due = queue.get_pending("clinic-1", 10);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].sync_id, v2.sync_id);
    }

    #[test]
    fn synced_after_first_attempt() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);
        let pending = queue.enqueue(record("patients", "p1", start())).unwrap();

        let claimed = queue.claim(&pending).unwrap();
        let synced = queue.mark_synced(&claimed, SyncOrigin::Pushed).unwrap();

        assert_eq!(synced.status, SyncStatus::Synced);
        assert_eq!(synced.attempts, 1);
        assert_eq!(synced.synced_at, Some(start()));
        assert_eq!(synced.last_origin, Some(SyncOrigin::Pushed));
        assert!(queue.claim(&synced).is_err());
    }

    #[test]
    fn failures_back_off_then_dead_letter() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);
        let mut current = queue.enqueue(record("patients", "p1", start())).unwrap();

        let mut previous_deadline = current.next_attempt_at;
        for attempt in 1..=3u32 {
            let claimed = queue.claim(&current).unwrap();
            current = queue.mark_failed(&claimed, &server_error()).unwrap();
            assert_eq!(current.attempts, attempt);
            assert!(current.next_attempt_at > previous_deadline);
            previous_deadline = current.next_attempt_at;

            if attempt < 3 {
                assert_eq!(current.status, SyncStatus::Pending);
                assert!(queue.get_pending("clinic-1", 10).is_empty());
                clock.set(current.next_attempt_at);
                assert_eq!(queue.get_pending("clinic-1", 10).len(), 1);
            }
        }

        assert_eq!(current.status, SyncStatus::DeadLetter);
        assert_eq!(current.backoff_ms, 4_000);
        assert_eq!(current.error_history.len(), 3);
        assert!(current.error_history.iter().all(|e| e.retryable));
        assert_eq!(queue.stats().dead_letter, 1);
    }

    #[test]
    fn error_history_respects_cap() {
        let clock = ManualClock::new(start());
        let queue = SyncQueue::in_memory(retry(10), 2, Arc::new(clock.clone())).unwrap();
        let mut current = queue.enqueue(record("patients", "p1", start())).unwrap();

        for _ in 0..4 {
            let claimed = queue.claim(&current).unwrap();
            current = queue.mark_failed(&claimed, &server_error()).unwrap();
        }
        assert_eq!(current.error_history.len(), 2);
        assert_eq!(current.error_history.front().unwrap().attempt, 3);
    }

    #[test]
    fn conflict_paths() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);

        let a = queue.enqueue(record("appointments", "a1", start())).unwrap();
        let claimed = queue.claim(&a).unwrap();
        let conflicted = queue
            .mark_conflict(&claimed, Some(json!({"slot": "10:00"})))
            .unwrap();
        assert_eq!(conflicted.status, SyncStatus::Conflict);
        assert_eq!(conflicted.attempts, 1);
        assert!(conflicted.conflict.detected);
        assert_eq!(conflicted.conflict.detected_at, Some(start()));

        let synced = queue
            .mark_synced(&conflicted, SyncOrigin::CentralWins)
            .unwrap();
        assert_eq!(synced.attempts, 1);
        assert_eq!(
            synced.conflict.resolution,
            Some(ConflictResolution::CentralWins)
        );

        let b = queue.enqueue(record("appointments", "a2", start())).unwrap();
        let claimed = queue.claim(&b).unwrap();
        let conflicted = queue.mark_conflict(&claimed, None).unwrap();
        let requeued = queue.requeue_local_wins(&conflicted).unwrap();
        assert_eq!(requeued.status, SyncStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(
            requeued.conflict.resolution,
            Some(ConflictResolution::LocalWins)
        );

        let c = queue.enqueue(record("appointments", "a3", start())).unwrap();
        let claimed = queue.claim(&c).unwrap();
        let conflicted = queue.mark_conflict(&claimed, None).unwrap();
        let held = queue.hold_conflict(&conflicted).unwrap();
        assert_eq!(held.status, SyncStatus::Conflict);
        assert_eq!(held.conflict.resolution, Some(ConflictResolution::Manual));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);
        let pending = queue.enqueue(record("patients", "p1", start())).unwrap();

        assert!(matches!(
            queue.mark_failed(&pending, &server_error()),
            Err(SyncError::InvalidStateTransition {
                from: SyncStatus::Pending,
                to: SyncStatus::Pending,
            })
        ));
        assert!(matches!(
            queue.hold_conflict(&pending),
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            queue.reset_for_retry(&pending.sync_id, "retry"),
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            queue.reset_for_retry(&SyncId::new(), "retry"),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn reset_for_retry_restores_budget() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 1);
        let pending = queue.enqueue(record("patients", "p1", start())).unwrap();
        let claimed = queue.claim(&pending).unwrap();
        let dead = queue.mark_failed(&claimed, &server_error()).unwrap();
        assert_eq!(dead.status, SyncStatus::DeadLetter);

        clock.advance(Duration::from_secs(10));
        let reset = queue.reset_for_retry(&dead.sync_id, "operator retry").unwrap();
        assert_eq!(reset.status, SyncStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert_eq!(reset.backoff_ms, 0);
        assert_eq!(reset.last_error(), Some("operator retry"));
        assert_eq!(queue.get_pending("clinic-1", 10).len(), 1);
    }

    #[test]
    fn remove_counts_existing() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);
        let a = queue.enqueue(record("patients", "p1", start())).unwrap();

        assert_eq!(queue.remove(&[a.sync_id, SyncId::new()]).unwrap(), 1);
        assert_eq!(queue.remove(&[a.sync_id]).unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn journal_replay_restores_state() {
        let clock = ManualClock::new(start());
        let backend = InMemoryBackend::new();
        let (synced_id, inflight_id) = {
            let queue = SyncQueue::open(
                Box::new(backend.clone()),
                retry(3),
                10,
                Arc::new(clock.clone()),
            )
            .unwrap();

            let a = queue.enqueue(record("patients", "p1", start())).unwrap();
            let b = queue.enqueue(record("patients", "p2", start())).unwrap();
            let gone = queue.enqueue(record("patients", "p3", start())).unwrap();

            let claimed = queue.claim(&a).unwrap();
            queue.mark_synced(&claimed, SyncOrigin::Pushed).unwrap();
            queue.claim(&b).unwrap();
            queue.remove(&[gone.sync_id]).unwrap();
            queue.set_watermark(start()).unwrap();
            queue.set_capture_cursor("patients", 42).unwrap();
            (a.sync_id, b.sync_id)
        };

        let queue = SyncQueue::open(Box::new(backend), retry(3), 10, Arc::new(clock)).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(&synced_id).unwrap().status, SyncStatus::Synced);
        assert_eq!(queue.get(&inflight_id).unwrap().status, SyncStatus::Pending);
        assert_eq!(queue.watermark(), Some(start()));
        assert_eq!(queue.capture_cursor("patients"), 42);
        assert_eq!(queue.capture_cursor("invoices"), 0);

        let next = queue.enqueue(record("patients", "p4", start())).unwrap();
        assert_eq!(next.sequence, 3);
    }

    #[test]
    fn file_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node").join("sync.journal");
        let clock = ManualClock::new(start());

        let id = {
            let queue =
                SyncQueue::open_file(&path, retry(3), 10, Arc::new(clock.clone())).unwrap();
            queue
                .enqueue(record("prescriptions", "rx1", start()))
                .unwrap()
                .sync_id
        };

        let queue = SyncQueue::open_file(&path, retry(3), 10, Arc::new(clock)).unwrap();
        let restored = queue.get(&id).unwrap();
        assert_eq!(restored.collection, "prescriptions");
        assert_eq!(restored.payload, Some(json!({"id": "rx1"})));
    }

    #[test]
    fn unchanged_cursor_and_watermark_are_not_journaled() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);

        queue.set_watermark(start()).unwrap();
        queue.set_watermark(start()).unwrap();
        queue.set_capture_cursor("patients", 1).unwrap();
        queue.set_capture_cursor("patients", 1).unwrap();
        assert_eq!(queue.journal_frames(), 2);
    }

    #[test]
    fn compacted_journal_reopens_to_same_state() {
        let clock = ManualClock::new(start());
        let backend = InMemoryBackend::new();
        let (synced_id, pending_id, frames_before) = {
            let queue = SyncQueue::open(
                Box::new(backend.clone()),
                retry(10),
                10,
                Arc::new(clock.clone()),
            )
            .unwrap();

            let a = queue.enqueue(record("patients", "p1", start())).unwrap();
            let claimed = queue.claim(&a).unwrap();
            queue.mark_synced(&claimed, SyncOrigin::Pushed).unwrap();

            let mut b = queue.enqueue(record("patients", "p2", start())).unwrap();
            for _ in 0..5 {
                let claimed = queue.claim(&b).unwrap();
                b = queue.mark_failed(&claimed, &server_error()).unwrap();
            }
            let gone = queue.enqueue(record("patients", "p3", start())).unwrap();
            queue.remove(&[gone.sync_id]).unwrap();
            for seq in 1..=20 {
                queue.set_capture_cursor("patients", seq).unwrap();
            }
            queue.set_watermark(start()).unwrap();

            let frames_before = queue.journal_frames();
            queue.compact().unwrap();
            assert_eq!(queue.journal_frames(), 5);
            (a.sync_id, b.sync_id, frames_before)
        };
        assert!(frames_before > 30);

        let queue = SyncQueue::open(Box::new(backend), retry(10), 10, Arc::new(clock)).unwrap();
        assert_eq!(queue.journal_frames(), 5);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get(&synced_id).unwrap().status, SyncStatus::Synced);
        let pending = queue.get(&pending_id).unwrap();
        assert_eq!(pending.status, SyncStatus::Pending);
        assert_eq!(pending.attempts, 5);
        assert_eq!(pending.error_history.len(), 5);
        assert_eq!(queue.capture_cursor("patients"), 20);
        assert_eq!(queue.watermark(), Some(start()));

        // The removed record's sequence is not handed out again.
        let next = queue.enqueue(record("patients", "p4", start())).unwrap();
        assert_eq!(next.sequence, 3);
    }

    #[test]
    fn journal_compacts_itself_when_it_outgrows_the_state() {
        let clock = ManualClock::new(start());
        let queue = queue_with(&clock, 3);
        queue.enqueue(record("patients", "p1", start())).unwrap();

        for seq in 1..=3 * COMPACT_MIN_FRAMES {
            queue.set_capture_cursor("patients", seq).unwrap();
        }
        assert!(queue.journal_frames() <= COMPACT_MIN_FRAMES);
        assert_eq!(queue.capture_cursor("patients"), 3 * COMPACT_MIN_FRAMES);
        assert_eq!(queue.len(), 1);
    }
}
