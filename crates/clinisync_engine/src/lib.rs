//! # Clinisync Engine
//!
//! Offline-first sync engine for clinic nodes.
//!
//! This crate provides:
//! - A durable, journaled [`SyncQueue`] with a per-record state machine
//! - [`ChangeCapture`] turning local commits into queued records
//! - [`Pusher`] and [`Puller`] for the two halves of a sync cycle
//! - [`ConflictResolver`] and the idempotent [`Applier`]
//! - [`DeadLetterManager`] for records that ran out of retries
//! - [`SyncEngine`], the single-flight periodic scheduler
//! - Transport abstraction with HTTP and mock implementations
//!
//! ## Architecture
//!
//! Each cycle **pushes then pulls**:
//! 1. Probe central; when it does not answer, skip the cycle
//! 2. Push due records with bounded concurrency
//! 3. Pull central changes since the watermark and apply them locally
//!
//! ## Key Invariants
//!
//! - A record is journaled no later than the capture cursor moves past its commit
//! - Records of one document are pushed in capture order
//! - Every record ends in `synced` or `dead_letter` once central answers
//! - `dead_letter` is reached only after `max_attempts` failed attempts
//! - Pulled documents carry the remote-origin marker and are never re-captured
//! - The watermark never moves past a change that failed to apply

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod capture;
mod clock;
mod config;
mod dead_letter;
mod error;
mod http;
mod puller;
mod pusher;
mod queue;
mod resolver;
mod scheduler;
mod store;
mod transport;

pub use applier::{ApplyOutcome, Applier};
pub use capture::{CaptureReport, ChangeCapture};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PriorityTable, RetryConfig, SyncConfig, Timeouts, DEFAULT_PRIORITY};
pub use dead_letter::DeadLetterManager;
pub use error::{SyncError, SyncResult};
pub use http::{
    HttpClient, HttpClientError, HttpRequest, HttpResponse, HttpTransport, LoopbackClient,
    LoopbackServer, Method, ReqwestClient,
};
pub use puller::{PullReport, Puller};
pub use pusher::{PushOutcome, PushReport, Pusher};
pub use queue::{QueueStats, SyncQueue};
pub use resolver::{ConflictResolver, ResolutionOutcome};
pub use scheduler::{CycleReport, EngineState, EngineStatus, SyncEngine, SyncEngineBuilder};
pub use store::{ChangeEvent, MemoryCollection, SyncCollection};
pub use transport::{CentralTransport, MockPull, MockPush, MockTransport};

pub use clinisync_protocol as protocol;
