//! Wire messages exchanged with the central authority.
//!
//! All messages are JSON with camelCase field names.

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::Operation;
use crate::record::{SyncId, SyncRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! json_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// Encodes to JSON bytes.
                pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
                    Ok(serde_json::to_vec(self)?)
                }

                /// Decodes from JSON bytes.
                pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
                    Ok(serde_json::from_slice(bytes)?)
                }
            }
        )*
    };
}

/// A single mutation pushed to central.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    /// Record id, used by central to deduplicate redelivery.
    pub sync_id: SyncId,
    /// Kind of mutation.
    pub operation: Operation,
    /// Logical entity type.
    pub collection: String,
    /// Entity id.
    pub document_id: String,
    /// Snapshot; `None` for deletes.
    pub data: Option<Value>,
    /// Fields touched by an update.
    #[serde(default)]
    pub changed_fields: Vec<String>,
    /// When the local change happened.
    pub changed_at: DateTime<Utc>,
    /// Overwrite central even if its version differs.
    #[serde(default)]
    pub force: bool,
}

impl PushItem {
    /// Builds the wire item for a queued record.
    pub fn from_record(record: &SyncRecord, force: bool) -> Self {
        Self {
            sync_id: record.sync_id,
            operation: record.operation,
            collection: record.collection.clone(),
            document_id: record.document_id.clone(),
            data: record.payload.clone(),
            changed_fields: record.changed_fields.clone(),
            changed_at: record.changed_at,
            force,
        }
    }
}

/// `push-single` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Pushing node.
    pub node_id: String,
    /// The mutation.
    pub item: PushItem,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(node_id: impl Into<String>, item: PushItem) -> Self {
        Self {
            node_id: node_id.into(),
            item,
        }
    }
}

/// Conflict details returned by central.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    /// Central's current version; `None` if central deleted the document.
    pub central_version: Option<Value>,
}

/// `push-single` response: `{accepted:true}` or `{conflict:{centralVersion}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Central accepted the mutation.
    #[serde(default)]
    pub accepted: bool,
    /// Central's version differs from what was pushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictBody>,
}

impl PushResponse {
    /// An accepting response.
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            conflict: None,
        }
    }

    /// A conflict response carrying central's version.
    pub fn conflict(central_version: Option<Value>) -> Self {
        Self {
            accepted: false,
            conflict: Some(ConflictBody { central_version }),
        }
    }

    /// Returns true if central reported a conflict.
    pub fn is_conflict(&self) -> bool {
        self.conflict.is_some()
    }

    /// Checks that exactly one of `accepted` and `conflict` is set.
    pub fn validate(&self) -> ProtocolResult<()> {
        match (self.accepted, &self.conflict) {
            (true, None) | (false, Some(_)) => Ok(()),
            (true, Some(_)) => Err(ProtocolError::Invalid(
                "push response is both accepted and conflicting".into(),
            )),
            (false, None) => Err(ProtocolError::Invalid(
                "push response is neither accepted nor conflicting".into(),
            )),
        }
    }
}

/// `pull` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Pulling node.
    pub node_id: String,
    /// Watermark; `None` pulls from the beginning.
    pub since: Option<DateTime<Utc>>,
    /// Page size.
    pub limit: u32,
}

impl PullRequest {
    /// Creates a pull request.
    pub fn new(node_id: impl Into<String>, since: Option<DateTime<Utc>>, limit: u32) -> Self {
        Self {
            node_id: node_id.into(),
            since,
            limit,
        }
    }
}

/// A change recorded by central.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    /// Logical entity type.
    pub collection: String,
    /// Entity id.
    pub document_id: String,
    /// Kind of mutation.
    pub operation: Operation,
    /// Document after the change; `None` for deletes.
    pub data: Option<Value>,
    /// When central recorded the change.
    pub changed_at: DateTime<Utc>,
}

/// `pull` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Changes with `changedAt > since`, oldest first.
    pub changes: Vec<RemoteChange>,
    /// Authoritative as-of time; the next watermark.
    pub timestamp: DateTime<Utc>,
    /// More changes are available past this page.
    #[serde(default)]
    pub has_more: bool,
}

impl PullResponse {
    /// Creates a pull response.
    pub fn new(changes: Vec<RemoteChange>, timestamp: DateTime<Utc>, has_more: bool) -> Self {
        Self {
            changes,
            timestamp,
            has_more,
        }
    }
}

/// `health` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Central is accepting traffic.
    pub ok: bool,
    /// Central's clock.
    pub timestamp: DateTime<Utc>,
}

json_codec!(PushRequest, PushResponse, PullRequest, PullResponse, HealthResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn push_response_shapes() {
        let accepted = PushResponse::accepted().encode().unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&accepted).unwrap(),
            json!({"accepted": true})
        );

        let conflict = PushResponse::decode(br#"{"conflict":{"centralVersion":{"name":"B"}}}"#)
            .unwrap();
        assert!(conflict.is_conflict());
        assert!(!conflict.accepted);
        assert!(conflict.validate().is_ok());
        assert_eq!(
            conflict.conflict.unwrap().central_version,
            Some(json!({"name": "B"}))
        );
    }

    #[test]
    fn push_response_validation() {
        assert!(PushResponse::decode(b"{}").unwrap().validate().is_err());

        let both = PushResponse {
            accepted: true,
            conflict: Some(ConflictBody {
                central_version: None,
            }),
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn push_item_from_record() {
        let changed_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let record = SyncRecord::new(
            "clinic-1",
            Operation::Update,
            "invoices",
            "inv-7",
            Some(json!({"total": 120})),
            changed_at,
        )
        .with_changed_fields(vec!["total".into()]);

        let item = PushItem::from_record(&record, true);
        let json = serde_json::to_value(&item).unwrap();

        assert_eq!(json["syncId"], record.sync_id.to_string());
        assert_eq!(json["documentId"], "inv-7");
        assert_eq!(json["changedFields"], json!(["total"]));
        assert_eq!(json["force"], true);
    }

    #[test]
    fn pull_response_defaults() {
        let response = PullResponse::decode(
            br#"{"changes":[{"collection":"patients","documentId":"p1","operation":"delete","data":null,"changedAt":"2024-01-01T00:00:00Z"}],"timestamp":"2024-01-02T00:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(response.changes.len(), 1);
        assert_eq!(response.changes[0].operation, Operation::Delete);
        assert!(response.changes[0].data.is_none());
        assert!(!response.has_more);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            PullRequest::decode(b"not json"),
            Err(ProtocolError::Json(_))
        ));
    }
}
