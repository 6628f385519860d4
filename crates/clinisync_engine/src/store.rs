//! Local entity stores as seen by the sync engine.
//!
//! A [`SyncCollection`] is one syncable collection of JSON documents with an
//! ordered change feed. Capture polls the feed by sequence cursor; the
//! applier writes remote changes through the `apply_*` methods, which flag
//! the resulting feed events as remote-origin.

use crate::clock::{Clock, SystemClock};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use clinisync_protocol::{is_remote_origin, strip_remote_origin, Operation, REMOTE_ORIGIN_FIELD};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// A committed mutation on a local collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Feed sequence, starting at 1.
    pub sequence: u64,
    /// Collection name.
    pub collection: String,
    /// Document id.
    pub document_id: String,
    /// Kind of mutation.
    pub operation: Operation,
    /// Document after the commit; `None` for deletes.
    pub document: Option<Value>,
    /// Top-level fields touched by an update.
    pub changed_fields: Vec<String>,
    /// Commit time.
    pub changed_at: DateTime<Utc>,
    /// Author of a local change.
    pub changed_by: Option<String>,
    /// Set when the sync applier made the commit.
    pub remote_origin: bool,
}

impl ChangeEvent {
    /// Returns true if the commit came from a pulled change.
    ///
    /// Upserts are recognised by the marker on the document, deletes by the
    /// event flag.
    pub fn is_remote_origin(&self) -> bool {
        self.remote_origin || self.document.as_ref().is_some_and(is_remote_origin)
    }
}

/// A syncable local collection.
pub trait SyncCollection: Send + Sync {
    /// Collection name, as used on the wire.
    fn name(&self) -> &str;

    /// Up to `limit` feed events with a sequence above `cursor`, oldest first.
    fn changes_since(&self, cursor: u64, limit: usize) -> SyncResult<Vec<ChangeEvent>>;

    /// Current version of a document.
    fn get(&self, document_id: &str) -> SyncResult<Option<Value>>;

    /// Writes a pulled document, replacing any existing version.
    ///
    /// The document already carries the remote-origin marker.
    fn apply_upsert(&self, document_id: &str, document: Value) -> SyncResult<()>;

    /// Deletes a document because of a pulled delete.
    ///
    /// Returns false if the document did not exist.
    fn apply_delete(&self, document_id: &str) -> SyncResult<bool>;

    /// Watch channel carrying the latest feed sequence after every commit.
    fn commits(&self) -> watch::Receiver<u64>;
}

#[derive(Default)]
struct CollectionInner {
    documents: BTreeMap<String, Value>,
    feed: Vec<ChangeEvent>,
    next_sequence: u64,
    failing: HashSet<String>,
}

/// In-memory collection with a change feed.
pub struct MemoryCollection {
    name: String,
    inner: RwLock<CollectionInner>,
    commits: watch::Sender<u64>,
    clock: Arc<dyn Clock>,
}

impl MemoryCollection {
    /// Creates an empty collection stamped by the system clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    /// Creates an empty collection stamped by `clock`.
    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let (commits, _) = watch::channel(0);
        Self {
            name: name.into(),
            inner: RwLock::new(CollectionInner {
                next_sequence: 1,
                ..CollectionInner::default()
            }),
            commits,
            clock,
        }
    }

    /// Creates or replaces a document as a local write.
    ///
    /// Returns the feed sequence of the commit.
    pub fn put(&self, document_id: impl Into<String>, document: Value) -> SyncResult<u64> {
        self.write_local(document_id.into(), Some(document), None)
    }

    /// Like [`put`](Self::put), recording who made the change.
    pub fn put_as(
        &self,
        document_id: impl Into<String>,
        document: Value,
        changed_by: impl Into<String>,
    ) -> SyncResult<u64> {
        self.write_local(document_id.into(), Some(document), Some(changed_by.into()))
    }

    /// Deletes a document as a local write.
    ///
    /// Returns `None` if the document did not exist.
    pub fn delete(&self, document_id: &str) -> SyncResult<Option<u64>> {
        if !self.inner.read().documents.contains_key(document_id) {
            return Ok(None);
        }
        self.write_local(document_id.to_string(), None, None).map(Some)
    }

    /// Current documents, ordered by id.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner.read().documents.clone()
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.inner.read().documents.len()
    }

    /// Returns true if the collection holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the latest commit (0 before the first).
    pub fn last_sequence(&self) -> u64 {
        self.inner.read().next_sequence - 1
    }

    /// Makes every write to `document_id` fail until [`heal`](Self::heal).
    pub fn fail_writes_to(&self, document_id: impl Into<String>) {
        self.inner.write().failing.insert(document_id.into());
    }

    /// Clears all injected write failures.
    pub fn heal(&self) {
        self.inner.write().failing.clear();
    }

    fn write_local(
        &self,
        document_id: String,
        mut document: Option<Value>,
        changed_by: Option<String>,
    ) -> SyncResult<u64> {
        if let Some(doc) = document.as_mut() {
            strip_remote_origin(doc);
        }
        self.commit(document_id, document, changed_by, false)
    }

    fn commit(
        &self,
        document_id: String,
        document: Option<Value>,
        changed_by: Option<String>,
        remote_origin: bool,
    ) -> SyncResult<u64> {
        let mut inner = self.inner.write();
        if inner.failing.contains(&document_id) {
            return Err(SyncError::apply(
                &self.name,
                &document_id,
                "collection refused the write",
            ));
        }

        let previous = inner.documents.get(&document_id);
        let (operation, changed_fields) = match (&document, previous) {
            (Some(_), None) => (Operation::Create, Vec::new()),
            (Some(next), Some(prev)) => (Operation::Update, changed_fields(prev, next)),
            (None, _) => (Operation::Delete, Vec::new()),
        };

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        match &document {
            Some(doc) => {
                inner.documents.insert(document_id.clone(), doc.clone());
            }
            None => {
                inner.documents.remove(&document_id);
            }
        }
        inner.feed.push(ChangeEvent {
            sequence,
            collection: self.name.clone(),
            document_id,
            operation,
            document,
            changed_fields,
            changed_at: self.clock.now(),
            changed_by,
            remote_origin,
        });
        drop(inner);

        self.commits.send_replace(sequence);
        Ok(sequence)
    }
}

impl SyncCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn changes_since(&self, cursor: u64, limit: usize) -> SyncResult<Vec<ChangeEvent>> {
        let inner = self.inner.read();
        // Sequences are dense and start at 1, so event `n` sits at index `n - 1`.
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(inner.feed.len());
        Ok(inner.feed[start..].iter().take(limit).cloned().collect())
    }

    fn get(&self, document_id: &str) -> SyncResult<Option<Value>> {
        Ok(self.inner.read().documents.get(document_id).cloned())
    }

    fn apply_upsert(&self, document_id: &str, document: Value) -> SyncResult<()> {
        let unchanged = {
            let inner = self.inner.read();
            if inner.failing.contains(document_id) {
                return Err(SyncError::apply(
                    &self.name,
                    document_id,
                    "collection refused the write",
                ));
            }
            inner.documents.get(document_id) == Some(&document)
        };
        if unchanged {
            return Ok(());
        }
        self.commit(document_id.to_string(), Some(document), None, true)
            .map(|_| ())
    }

    fn apply_delete(&self, document_id: &str) -> SyncResult<bool> {
        {
            let inner = self.inner.read();
            if inner.failing.contains(document_id) {
                return Err(SyncError::apply(
                    &self.name,
                    document_id,
                    "collection refused the write",
                ));
            }
            if !inner.documents.contains_key(document_id) {
                return Ok(false);
            }
        }
        self.commit(document_id.to_string(), None, None, true)
            .map(|_| true)
    }

    fn commits(&self) -> watch::Receiver<u64> {
        self.commits.subscribe()
    }
}

/// Top-level keys whose values differ between two object documents.
fn changed_fields(previous: &Value, next: &Value) -> Vec<String> {
    let (Some(prev), Some(next)) = (previous.as_object(), next.as_object()) else {
        return Vec::new();
    };

    let keys: BTreeSet<&String> = prev.keys().chain(next.keys()).collect();
    keys.into_iter()
        .filter(|k| k.as_str() != REMOTE_ORIGIN_FIELD && prev.get(*k) != next.get(*k))
        .cloned()
        .collect()
}
