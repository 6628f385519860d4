//! Materializes remote changes in local collections.
//!
//! Applying is idempotent by `(collection, documentId)`: creates and updates
//! overwrite, deletes remove the document if it is still there. Every
//! written document carries the remote-origin marker so change capture
//! ignores the resulting commit.

use crate::error::{SyncError, SyncResult};
use crate::store::SyncCollection;
use clinisync_protocol::{mark_remote_origin, Operation, RemoteChange};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Effect of applying one remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The document was created or overwritten.
    Upserted,
    /// The document was deleted.
    Deleted,
    /// A delete found nothing to remove.
    AlreadyAbsent,
}

/// Writes pulled changes into the registered collections.
#[derive(Clone)]
pub struct Applier {
    collections: HashMap<String, Arc<dyn SyncCollection>>,
}

impl Applier {
    /// Creates an applier over `collections`, keyed by their names.
    pub fn new(collections: &[Arc<dyn SyncCollection>]) -> Self {
        let collections = collections
            .iter()
            .map(|c| (c.name().to_string(), Arc::clone(c)))
            .collect();
        Self { collections }
    }

    /// Returns the collection registered under `name`.
    pub fn collection(&self, name: &str) -> SyncResult<&Arc<dyn SyncCollection>> {
        self.collections
            .get(name)
            .ok_or_else(|| SyncError::UnknownCollection(name.to_string()))
    }

    /// Applies a single remote change.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownCollection`] for unregistered collections,
    /// [`SyncError::Apply`] when a create or update carries no document, and
    /// whatever the collection reports when the write fails.
    pub fn apply(&self, change: &RemoteChange) -> SyncResult<ApplyOutcome> {
        let collection = self.collection(&change.collection)?;

        let outcome = match change.operation {
            Operation::Create | Operation::Update => {
                let mut document = change.data.clone().ok_or_else(|| {
                    SyncError::apply(
                        &change.collection,
                        &change.document_id,
                        format!("{} without document body", change.operation),
                    )
                })?;
                mark_remote_origin(&mut document);
                collection.apply_upsert(&change.document_id, document)?;
                ApplyOutcome::Upserted
            }
            Operation::Delete => {
                if collection.apply_delete(&change.document_id)? {
                    ApplyOutcome::Deleted
                } else {
                    ApplyOutcome::AlreadyAbsent
                }
            }
        };

        debug!(
            collection = %change.collection,
            document_id = %change.document_id,
            operation = %change.operation,
            outcome = ?outcome,
            "applied remote change"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCollection;
    use chrono::{TimeZone, Utc};
    use clinisync_protocol::is_remote_origin;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn change(operation: Operation, id: &str, data: Option<Value>) -> RemoteChange {
        RemoteChange {
            collection: "patients".into(),
            document_id: id.into(),
            operation,
            data,
            changed_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn setup() -> (Arc<MemoryCollection>, Applier) {
        let patients = Arc::new(MemoryCollection::new("patients"));
        let applier = Applier::new(&[patients.clone() as Arc<dyn SyncCollection>]);
        (patients, applier)
    }

    #[test]
    fn upsert_marks_remote_origin() {
        let (patients, applier) = setup();

        let outcome = applier
            .apply(&change(Operation::Create, "p1", Some(json!({"name": "Amina"}))))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Upserted);

        let stored = patients.get("p1").unwrap().unwrap();
        assert_eq!(stored["name"], "Amina");
        assert!(is_remote_origin(&stored));
    }

    #[test]
    fn update_overwrites() {
        let (patients, applier) = setup();
        patients.put("p1", json!({"name": "Amina", "phone": "1"})).unwrap();

        applier
            .apply(&change(Operation::Update, "p1", Some(json!({"name": "Amina K."}))))
            .unwrap();

        let stored = patients.get("p1").unwrap().unwrap();
        assert_eq!(stored["name"], "Amina K.");
        assert!(stored.get("phone").is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let (patients, applier) = setup();
        patients.put("p1", json!({"name": "Amina"})).unwrap();

        let delete = change(Operation::Delete, "p1", None);
        assert_eq!(applier.apply(&delete).unwrap(), ApplyOutcome::Deleted);
        assert_eq!(applier.apply(&delete).unwrap(), ApplyOutcome::AlreadyAbsent);
        assert!(patients.is_empty());
    }

    #[test]
    fn unknown_collection_fails() {
        let (_, applier) = setup();
        let mut remote = change(Operation::Create, "x", Some(json!({})));
        remote.collection = "unicorns".into();

        assert!(matches!(
            applier.apply(&remote),
            Err(SyncError::UnknownCollection(name)) if name == "unicorns"
        ));
    }

    #[test]
    fn upsert_requires_body() {
        let (_, applier) = setup();
        let err = applier.apply(&change(Operation::Update, "p1", None)).unwrap_err();
        assert!(matches!(err, SyncError::Apply { .. }));
    }

    #[test]
    fn write_failure_surfaces() {
        let (patients, applier) = setup();
        patients.fail_writes_to("p1");

        let err = applier
            .apply(&change(Operation::Create, "p1", Some(json!({"name": "Amina"}))))
            .unwrap_err();
        assert!(matches!(err, SyncError::Apply { .. }));
        assert!(patients.is_empty());
    }

    fn operation_strategy() -> impl Strategy<Value = (Operation, Option<Value>)> {
        prop_oneof![
            "[a-z]{1,8}".prop_map(|name| (Operation::Create, Some(json!({"name": name})))),
            (0u32..1000).prop_map(|n| (Operation::Update, Some(json!({"visits": n})))),
            Just((Operation::Delete, None)),
        ]
    }

    proptest! {
        #[test]
        fn applying_twice_equals_applying_once(
            existing in proptest::option::of("[a-z]{1,8}"),
            ops in proptest::collection::vec(("p[0-3]", operation_strategy()), 1..12),
        ) {
            let (patients, applier) = setup();
            if let Some(name) = existing {
                patients.put("p0", json!({"name": name})).unwrap();
            }

            for (id, (operation, data)) in ops {
                let remote = change(operation, &id, data);
                applier.apply(&remote).unwrap();
                let once = patients.snapshot();
                applier.apply(&remote).unwrap();
                prop_assert_eq!(once, patients.snapshot());
            }
        }
    }
}
