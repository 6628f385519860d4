//! Outbound sync records and their state machine.

use crate::document::document_timestamp;
use crate::operation::Operation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Globally unique identity of a sync record.
///
/// Generated at capture time from a random UUID and never reused, so two
/// nodes can never produce the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncId(Uuid);

impl SyncId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SyncId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SyncId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a sync record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Waiting to be pushed.
    Pending,
    /// Claimed by the pusher, transmission in flight.
    Syncing,
    /// Accepted by the central authority (terminal).
    Synced,
    /// Central reported a version conflict.
    Conflict,
    /// Retry budget exhausted; held for an operator.
    DeadLetter,
}

impl SyncStatus {
    /// Every status, in display order.
    pub const ALL: [SyncStatus; 5] = [
        SyncStatus::Pending,
        SyncStatus::Syncing,
        SyncStatus::Synced,
        SyncStatus::Conflict,
        SyncStatus::DeadLetter,
    ];

    /// Returns true if `self → next` is an edge of the status DAG.
    ///
    /// `DeadLetter → Pending` is the operator retry edge; `Syncing →
    /// Pending` covers both a retryable failure and inflight recovery after
    /// a crash.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Syncing, Synced)
                | (Syncing, Conflict)
                | (Syncing, Pending)
                | (Syncing, DeadLetter)
                | (Conflict, Synced)
                | (Conflict, Pending)
                | (DeadLetter, Pending)
        )
    }

    /// Returns true for states that never progress without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Synced | SyncStatus::DeadLetter)
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a record's bounded error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// Attempt number the error belongs to (0 for operator notes).
    pub attempt: u32,
    /// Human-readable message.
    pub message: String,
    /// Whether the failure was considered transient.
    pub retryable: bool,
}

/// How a conflict was (or will be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// The central version was applied locally.
    CentralWins,
    /// The local version is force-pushed over the central one.
    LocalWins,
    /// Frozen until an operator decides.
    Manual,
}

/// Conflict bookkeeping of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    /// Whether central ever reported a conflict for this record.
    pub detected: bool,
    /// Central's version of the document; `None` when central deleted it.
    pub central_version: Option<Value>,
    /// Chosen resolution.
    pub resolution: Option<ConflictResolution>,
    /// When the conflict was detected.
    pub detected_at: Option<DateTime<Utc>>,
}

/// How a record reached `synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOrigin {
    /// Central accepted the pushed payload.
    Pushed,
    /// A conflict was settled by applying the central version.
    CentralWins,
}

/// One outbound mutation waiting to reach the central authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    /// Unique record id.
    pub sync_id: SyncId,
    /// Owning node.
    pub node_id: String,
    /// Kind of mutation.
    pub operation: Operation,
    /// Logical entity type.
    pub collection: String,
    /// Entity id within the collection.
    pub document_id: String,
    /// Snapshot at capture time; `None` for delete tombstones.
    pub payload: Option<Value>,
    /// Fields touched by an update (diff hint only).
    #[serde(default)]
    pub changed_fields: Vec<String>,
    /// Lower is more urgent.
    pub priority: u8,
    /// Lifecycle state.
    pub status: SyncStatus,
    /// Completed transmission attempts.
    pub attempts: u32,
    /// Earliest time the pusher may pick the record up.
    pub next_attempt_at: DateTime<Utc>,
    /// Last backoff delay applied, in milliseconds.
    #[serde(default)]
    pub backoff_ms: u64,
    /// Most recent errors, oldest first.
    #[serde(default)]
    pub error_history: VecDeque<ErrorEntry>,
    /// Conflict bookkeeping.
    #[serde(default)]
    pub conflict: ConflictInfo,
    /// When the local commit happened.
    pub changed_at: DateTime<Utc>,
    /// Who made the local change.
    pub changed_by: Option<String>,
    /// When the record reached `synced`.
    pub synced_at: Option<DateTime<Utc>>,
    /// How the record reached `synced`.
    pub last_origin: Option<SyncOrigin>,
    /// Queue-local enqueue order.
    #[serde(default)]
    pub sequence: u64,
}

impl SyncRecord {
    /// Creates a pending record due immediately.
    pub fn new(
        node_id: impl Into<String>,
        operation: Operation,
        collection: impl Into<String>,
        document_id: impl Into<String>,
        payload: Option<Value>,
        changed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sync_id: SyncId::new(),
            node_id: node_id.into(),
            operation,
            collection: collection.into(),
            document_id: document_id.into(),
            payload,
            changed_fields: Vec::new(),
            priority: 5,
            status: SyncStatus::Pending,
            attempts: 0,
            next_attempt_at: changed_at,
            backoff_ms: 0,
            error_history: VecDeque::new(),
            conflict: ConflictInfo::default(),
            changed_at,
            changed_by: None,
            synced_at: None,
            last_origin: None,
            sequence: 0,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the changed fields hint.
    pub fn with_changed_fields(mut self, fields: Vec<String>) -> Self {
        self.changed_fields = fields;
        self
    }

    /// Sets the author of the change.
    pub fn with_changed_by(mut self, changed_by: impl Into<String>) -> Self {
        self.changed_by = Some(changed_by.into());
        self
    }

    /// Timestamp used for last-write-wins: the payload's `updatedAt`, or
    /// the capture time when the payload has none.
    pub fn local_timestamp(&self) -> DateTime<Utc> {
        self.payload
            .as_ref()
            .and_then(document_timestamp)
            .unwrap_or(self.changed_at)
    }

    /// Appends to the error history, dropping the oldest entries over `cap`.
    pub fn push_error(&mut self, entry: ErrorEntry, cap: usize) {
        self.error_history.push_back(entry);
        while self.error_history.len() > cap.max(1) {
            self.error_history.pop_front();
        }
    }

    /// Last recorded error message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.error_history.back().map(|e| e.message.as_str())
    }
}
