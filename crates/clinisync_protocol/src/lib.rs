//! # Clinisync Protocol
//!
//! Data model and wire types shared by clinic nodes and the central
//! authority.
//!
//! This crate provides:
//! - [`SyncRecord`] and its [`SyncStatus`] state machine
//! - [`ConflictStrategy`] and the deterministic conflict decision
//! - Wire messages for push-single, pull and health
//! - Helpers for the remote-origin marker carried by replicated documents
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod document;
mod error;
mod messages;
mod operation;
mod record;

pub use conflict::{ConflictDecision, ConflictStrategy};
pub use document::{
    document_timestamp, is_remote_origin, mark_remote_origin, stamp_timestamp,
    strip_remote_origin, REMOTE_ORIGIN_FIELD, UPDATED_AT_FIELD,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ConflictBody, HealthResponse, PullRequest, PullResponse, PushItem, PushRequest, PushResponse,
    RemoteChange,
};
pub use operation::Operation;
pub use record::{
    ConflictInfo, ConflictResolution, ErrorEntry, SyncId, SyncOrigin, SyncRecord, SyncStatus,
};
