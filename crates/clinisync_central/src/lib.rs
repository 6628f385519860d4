//! # Clinisync Central
//!
//! Reference in-memory central authority for Clinisync nodes.
//!
//! This crate provides:
//! - `GET /sync/health`, `POST /sync/push` and `POST /sync/pull` handlers
//! - A change log with strictly increasing timestamps
//! - Conflict detection against writes from other nodes
//!
//! # Protocol
//!
//! Nodes push one change per request. A push conflicts when another node
//! (or central itself) wrote the document with a later change time; the
//! answer is 409 carrying central's version unless the push is forced.
//! Pulls return changes from other nodes in log order, paged by
//! `hasMore`, with a timestamp the node resumes from.
//!
//! Sync ids are remembered, so a retried push is acknowledged without
//! being recorded twice.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod changelog;
mod config;
mod error;
mod handler;
mod server;

pub use changelog::{ChangeLog, PushVerdict, CENTRAL_NODE};
pub use config::CentralConfig;
pub use error::{CentralError, CentralResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::CentralServer;
