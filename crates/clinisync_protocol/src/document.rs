//! Helpers for replicated JSON documents.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Field stamped on documents written by the sync applier.
///
/// Change capture discards commits whose document carries it, which is what
/// stops a pulled change from being pushed straight back.
pub const REMOTE_ORIGIN_FIELD: &str = "_remoteOrigin";

/// Field holding a document's last modification time (RFC 3339).
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Stamps the remote-origin marker on an object document.
///
/// Non-object values are left untouched.
pub fn mark_remote_origin(document: &mut Value) {
    if let Value::Object(map) = document {
        map.insert(REMOTE_ORIGIN_FIELD.to_string(), Value::Bool(true));
    }
}

/// Removes the remote-origin marker, as a local write does.
pub fn strip_remote_origin(document: &mut Value) {
    if let Value::Object(map) = document {
        map.remove(REMOTE_ORIGIN_FIELD);
    }
}

/// Returns true if the document carries the remote-origin marker.
pub fn is_remote_origin(document: &Value) -> bool {
    document
        .get(REMOTE_ORIGIN_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Reads the `updatedAt` timestamp of a document, if present and valid.
pub fn document_timestamp(document: &Value) -> Option<DateTime<Utc>> {
    document
        .get(UPDATED_AT_FIELD)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Sets `updatedAt` on an object document that has no valid one.
///
/// An existing valid timestamp is kept.
pub fn stamp_timestamp(document: &mut Value, at: DateTime<Utc>) {
    if document_timestamp(document).is_some() {
        return;
    }
    if let Value::Object(map) = document {
        map.insert(UPDATED_AT_FIELD.to_string(), Value::String(at.to_rfc3339()));
    }
}
