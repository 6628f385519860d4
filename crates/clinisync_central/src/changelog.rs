//! Central document state and change log.

use chrono::{DateTime, Duration, Utc};
use clinisync_protocol::{
    stamp_timestamp, strip_remote_origin, Operation, PushItem, RemoteChange, SyncId,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Node id recorded for edits made directly on central.
pub const CENTRAL_NODE: &str = "central";

/// How central answered a push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushVerdict {
    /// The change was recorded.
    Accepted,
    /// The sync id was seen before; nothing changed.
    Duplicate,
    /// The same node already wrote a later version; acknowledged, not written.
    Superseded,
    /// Another node wrote a newer version; carries central's version.
    ///
    /// An object version without a valid `updatedAt` is stamped with the
    /// change time central holds for it.
    Conflict(Option<Value>),
}

#[derive(Debug, Clone)]
struct StoredDocument {
    /// `None` once deleted.
    data: Option<Value>,
    last_node: String,
    changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LoggedChange {
    node_id: String,
    change: RemoteChange,
}

#[derive(Default)]
struct LogState {
    documents: HashMap<(String, String), StoredDocument>,
    changes: Vec<LoggedChange>,
    seen: HashSet<SyncId>,
    // Latest timestamp issued or served; new changes are stamped after it.
    floor: Option<DateTime<Utc>>,
}

impl LogState {
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.floor {
            Some(floor) if now <= floor => floor + Duration::microseconds(1),
            _ => now,
        };
        self.floor = Some(ts);
        ts
    }

    fn served_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = self.floor.map_or(now, |floor| floor.max(now));
        self.floor = Some(ts);
        ts
    }
}

/// Central's documents and the ordered log of accepted changes.
///
/// Change timestamps are strictly increasing and never at or below a
/// timestamp already handed out by a pull, so a node that resumes from a
/// pull timestamp misses nothing.
pub struct ChangeLog {
    state: RwLock<LogState>,
}

impl ChangeLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState::default()),
        }
    }

    /// Records a pushed change unless it conflicts or was seen before.
    ///
    /// A push conflicts when the document was last written by another node
    /// with a later change time and the push is not forced. An unforced
    /// push older than the same node's last write is superseded.
    pub fn push(&self, node_id: &str, item: &PushItem) -> PushVerdict {
        let mut state = self.state.write();
        if state.seen.contains(&item.sync_id) {
            debug!(sync_id = %item.sync_id, "duplicate push ignored");
            return PushVerdict::Duplicate;
        }

        let key = (item.collection.clone(), item.document_id.clone());
        if let Some(existing) = state.documents.get(&key) {
            if !item.force && existing.changed_at > item.changed_at {
                if existing.last_node == node_id {
                    debug!(
                        sync_id = %item.sync_id,
                        collection = %item.collection,
                        document_id = %item.document_id,
                        node_id,
                        "push older than the node's last write, not applied"
                    );
                    state.seen.insert(item.sync_id);
                    return PushVerdict::Superseded;
                }

                debug!(
                    collection = %item.collection,
                    document_id = %item.document_id,
                    node_id,
                    holder = %existing.last_node,
                    "push conflicts with newer central version"
                );
                let central = existing.data.clone().map(|mut doc| {
                    stamp_timestamp(&mut doc, existing.changed_at);
                    doc
                });
                return PushVerdict::Conflict(central);
            }
        }

        state.seen.insert(item.sync_id);
        Self::record(
            &mut state,
            node_id,
            &item.collection,
            &item.document_id,
            item.operation,
            item.data.clone(),
            item.changed_at,
        );
        PushVerdict::Accepted
    }

    /// Writes a document on behalf of `node_id` without conflict checks.
    ///
    /// Returns the change's log timestamp.
    pub fn write(
        &self,
        node_id: &str,
        collection: &str,
        document_id: &str,
        operation: Operation,
        data: Option<Value>,
        changed_at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut state = self.state.write();
        Self::record(
            &mut state,
            node_id,
            collection,
            document_id,
            operation,
            data,
            changed_at,
        )
    }

    fn record(
        state: &mut LogState,
        node_id: &str,
        collection: &str,
        document_id: &str,
        operation: Operation,
        data: Option<Value>,
        changed_at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let data = if operation.is_delete() {
            None
        } else {
            data.map(|mut doc| {
                strip_remote_origin(&mut doc);
                doc
            })
        };

        let logged_at = state.next_timestamp();
        state.documents.insert(
            (collection.to_string(), document_id.to_string()),
            StoredDocument {
                data: data.clone(),
                last_node: node_id.to_string(),
                changed_at,
            },
        );
        state.changes.push(LoggedChange {
            node_id: node_id.to_string(),
            change: RemoteChange {
                collection: collection.to_string(),
                document_id: document_id.to_string(),
                operation,
                data,
                changed_at: logged_at,
            },
        });
        logged_at
    }

    /// Changes after `since` made by nodes other than `node_id`.
    ///
    /// Returns at most `limit` changes, whether more are waiting, and the
    /// timestamp the caller may resume from.
    pub fn changes_since(
        &self,
        node_id: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> (Vec<RemoteChange>, bool, DateTime<Utc>) {
        let limit = limit.max(1);
        let mut state = self.state.write();
        let start = since.map_or(0, |since| {
            state
                .changes
                .partition_point(|c| c.change.changed_at <= since)
        });

        let mut changes: Vec<RemoteChange> = state.changes[start..]
            .iter()
            .filter(|c| c.node_id != node_id)
            .take(limit + 1)
            .map(|c| c.change.clone())
            .collect();

        let has_more = changes.len() > limit;
        changes.truncate(limit);
        let timestamp = match changes.last() {
            Some(last) if has_more => last.changed_at,
            _ => state.served_timestamp(),
        };
        (changes, has_more, timestamp)
    }

    /// Current version of a document; `None` if absent or deleted.
    pub fn document(&self, collection: &str, document_id: &str) -> Option<Value> {
        self.state
            .read()
            .documents
            .get(&(collection.to_string(), document_id.to_string()))
            .and_then(|d| d.data.clone())
    }

    /// Number of logged changes.
    pub fn len(&self) -> usize {
        self.state.read().changes.len()
    }

    /// Returns true if no change was logged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + minutes * 60, 0).unwrap()
    }

    fn item(id: &str, data: Value, changed_at: DateTime<Utc>) -> PushItem {
        PushItem {
            sync_id: SyncId::new(),
            operation: Operation::Update,
            collection: "patients".into(),
            document_id: id.into(),
            data: Some(data),
            changed_fields: Vec::new(),
            changed_at,
            force: false,
        }
    }

    #[test]
    fn empty_log() {
        let log = ChangeLog::new();
        assert!(log.is_empty());
        let (changes, has_more, _) = log.changes_since("clinic-1", None, 10);
        assert!(changes.is_empty());
        assert!(!has_more);
    }

    #[test]
    fn accepts_and_dedupes() {
        let log = ChangeLog::new();
        let push = item("p1", json!({"name": "Amina", "_remoteOrigin": true}), at(1));

        assert_eq!(log.push("clinic-1", &push), PushVerdict::Accepted);
        assert_eq!(log.push("clinic-1", &push), PushVerdict::Duplicate);
        assert_eq!(log.len(), 1);
        assert_eq!(log.document("patients", "p1"), Some(json!({"name": "Amina"})));
    }

    #[test]
    fn stale_write_from_other_node_conflicts() {
        let log = ChangeLog::new();
        log.push("clinic-2", &item("p1", json!({"name": "B"}), at(5)));

        let stale = item("p1", json!({"name": "A"}), at(3));
        assert_eq!(
            log.push("clinic-1", &stale),
            PushVerdict::Conflict(Some(
                json!({"name": "B", "updatedAt": at(5).to_rfc3339()})
            ))
        );

        let mut forced = stale.clone();
        forced.force = true;
        assert_eq!(log.push("clinic-1", &forced), PushVerdict::Accepted);
        assert_eq!(log.document("patients", "p1"), Some(json!({"name": "A"})));
    }

    #[test]
    fn conflict_keeps_document_timestamp() {
        let log = ChangeLog::new();
        let stamped = json!({"name": "B", "updatedAt": "2023-01-01T00:00:00Z"});
        log.push("clinic-2", &item("p1", stamped.clone(), at(5)));

        let verdict = log.push("clinic-1", &item("p1", json!({"name": "A"}), at(3)));
        assert_eq!(verdict, PushVerdict::Conflict(Some(stamped)));
    }

    #[test]
    fn older_write_from_same_node_is_superseded() {
        let log = ChangeLog::new();
        log.push("clinic-1", &item("p1", json!({"name": "v2"}), at(2)));

        let older = item("p1", json!({"name": "v1"}), at(1));
        assert_eq!(log.push("clinic-1", &older), PushVerdict::Superseded);
        assert_eq!(log.push("clinic-1", &older), PushVerdict::Duplicate);
        assert_eq!(log.document("patients", "p1"), Some(json!({"name": "v2"})));
        assert_eq!(log.len(), 1);

        // Forcing still writes, and a newer own write is applied.
        let mut forced = item("p1", json!({"name": "v0"}), at(0));
        forced.force = true;
        assert_eq!(log.push("clinic-1", &forced), PushVerdict::Accepted);
        let newer = item("p1", json!({"name": "v3"}), at(3));
        assert_eq!(log.push("clinic-1", &newer), PushVerdict::Accepted);
        assert_eq!(log.document("patients", "p1"), Some(json!({"name": "v3"})));
    }

    #[test]
    fn deleted_document_conflicts_with_none() {
        let log = ChangeLog::new();
        log.write(CENTRAL_NODE, "patients", "p1", Operation::Delete, None, at(9));

        let verdict = log.push("clinic-1", &item("p1", json!({"name": "A"}), at(3)));
        assert_eq!(verdict, PushVerdict::Conflict(None));
        assert!(log.document("patients", "p1").is_none());
    }

    #[test]
    fn pull_excludes_own_changes() {
        let log = ChangeLog::new();
        log.push("clinic-1", &item("p1", json!({"n": 1}), at(1)));
        log.push("clinic-2", &item("p2", json!({"n": 2}), at(1)));

        let (changes, _, _) = log.changes_since("clinic-1", None, 10);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].document_id, "p2");
    }

    #[test]
    fn pull_pages_resume_from_timestamp() {
        let log = ChangeLog::new();
        for i in 0..5 {
            log.write(
                CENTRAL_NODE,
                "patients",
                &format!("p{i}"),
                Operation::Create,
                Some(json!({"n": i})),
                at(i),
            );
        }

        let (first, has_more, ts) = log.changes_since("clinic-1", None, 2);
        assert_eq!(first.len(), 2);
        assert!(has_more);
        assert_eq!(ts, first[1].changed_at);

        let (second, _, ts) = log.changes_since("clinic-1", Some(ts), 2);
        assert_eq!(second[0].document_id, "p2");

        let (rest, has_more, ts) = log.changes_since("clinic-1", Some(ts), 10);
        assert_eq!(rest.len(), 1);
        assert!(!has_more);

        let later = log.write(CENTRAL_NODE, "patients", "p9", Operation::Create, None, at(9));
        assert!(later > ts);
        let (after, _, _) = log.changes_since("clinic-1", Some(ts), 10);
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn timestamps_strictly_increase() {
        let log = ChangeLog::new();
        let stamps: Vec<_> = (0..50)
            .map(|i| {
                log.write(
                    "clinic-1",
                    "patients",
                    "p1",
                    Operation::Update,
                    Some(json!({"n": i})),
                    at(0),
                )
            })
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }
}
