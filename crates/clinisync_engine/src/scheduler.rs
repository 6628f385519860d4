//! The sync engine: wiring, periodic scheduling and the operator surface.
//!
//! A [`SyncEngine`] owns one node's queue and drives cycles of push then
//! pull. Cycles are single-flight: a tick or forced sync that arrives while
//! a cycle runs is skipped and counted.

use crate::applier::Applier;
use crate::capture::{CaptureReport, ChangeCapture};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::dead_letter::DeadLetterManager;
use crate::error::{SyncError, SyncResult};
use crate::puller::{PullReport, Puller};
use crate::pusher::{PushReport, Pusher};
use crate::queue::{QueueStats, SyncQueue};
use crate::resolver::{ConflictResolver, ResolutionOutcome};
use crate::store::SyncCollection;
use crate::transport::CentralTransport;
use chrono::{DateTime, Utc};
use clinisync_protocol::{strip_remote_origin, ConflictDecision, Operation, SyncId, SyncRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Whether the engine's background tasks are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not started, or stopped.
    Stopped,
    /// Background tasks running, no cycle in progress.
    Idle,
    /// A cycle is in progress.
    Syncing,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
    /// Wall time the cycle took.
    pub duration: Duration,
    /// Push phase summary.
    pub push: PushReport,
    /// Pull phase summary; `None` when central was unreachable.
    pub pull: Option<PullReport>,
}

impl CycleReport {
    /// Whether central was reachable during the cycle.
    pub fn online(&self) -> bool {
        self.push.online
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Scheduler state.
    pub state: EngineState,
    /// Reachability seen by the last cycle; `None` before the first one.
    pub online: Option<bool>,
    /// Queue counts per status.
    pub queue: QueueStats,
    /// Pull watermark.
    pub watermark: Option<DateTime<Utc>>,
    /// Last finished cycle.
    pub last_cycle: Option<CycleReport>,
    /// Cycles finished since the engine was built.
    pub cycles_completed: u64,
    /// Cycles skipped because another one was running.
    pub cycles_skipped: u64,
}

struct EngineCore {
    config: SyncConfig,
    queue: Arc<SyncQueue>,
    capture: Arc<ChangeCapture>,
    applier: Applier,
    resolver: Arc<ConflictResolver>,
    pusher: Pusher,
    puller: Puller,
    clock: Arc<dyn Clock>,
    in_flight: AtomicBool,
    cycles_completed: AtomicU64,
    cycles_skipped: AtomicU64,
    online: RwLock<Option<bool>>,
    last_cycle: RwLock<Option<CycleReport>>,
}

/// Clears the single-flight flag when a cycle ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EngineCore {
    async fn run_cycle(&self) -> Option<CycleReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.note_skipped();
            return None;
        }
        let _guard = FlightGuard(&self.in_flight);
        Some(self.cycle().await)
    }

    fn note_skipped(&self) {
        let skipped = self.cycles_skipped.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(skipped, "sync cycle already running, skipping");
    }

    #[instrument(skip(self), fields(node_id = %self.config.node_id))]
    async fn cycle(&self) -> CycleReport {
        let started_at = self.clock.now();
        let start = Instant::now();

        let push = self.pusher.run().await;
        *self.online.write() = Some(push.online);

        // Without central there is nothing to pull either.
        let pull = if push.online {
            Some(self.puller.run().await)
        } else {
            None
        };

        let report = CycleReport {
            started_at,
            duration: start.elapsed(),
            push,
            pull,
        };
        let completed = self.cycles_completed.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            cycle = completed,
            online = report.online(),
            pushed = report.push.synced,
            pulled = report.pull.as_ref().map_or(0, |p| p.applied),
            duration_ms = report.duration.as_millis() as u64,
            "sync cycle finished"
        );
        *self.last_cycle.write() = Some(report.clone());
        report
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Offline-first sync engine of one node.
pub struct SyncEngine {
    core: Arc<EngineCore>,
    dead_letters: DeadLetterManager,
    running: Mutex<Option<Running>>,
}

impl SyncEngine {
    /// Starts building an engine for `config`.
    pub fn builder(config: SyncConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.core.config
    }

    /// The engine's queue.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.core.queue
    }

    /// Spawns the change listeners and the periodic scheduler.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadyRunning`] if the engine was started and
    /// not stopped.
    pub fn start(&self) -> SyncResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let mut tasks = self.core.capture.spawn_listeners(cancel.clone());
        tasks.push(tokio::spawn(tick_loop(
            Arc::clone(&self.core),
            cancel.clone(),
        )));
        *running = Some(Running { cancel, tasks });

        info!(
            node_id = %self.core.config.node_id,
            interval_ms = self.core.config.sync_interval.as_millis() as u64,
            "sync engine started"
        );
        Ok(())
    }

    /// Stops the background tasks and waits for them to finish.
    ///
    /// A cycle in progress runs to completion first.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        info!(node_id = %self.core.config.node_id, "sync engine stopped");
    }

    /// Returns true between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Runs one push-then-pull cycle now.
    ///
    /// Returns `None` if another cycle is already running.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        self.core.run_cycle().await
    }

    /// Captures pending local commits, then runs a cycle.
    pub async fn force_sync(&self) -> (CaptureReport, Option<CycleReport>) {
        let capture = self.core.capture.capture_once_blocking().await;
        (capture, self.core.run_cycle().await)
    }

    /// Point-in-time status.
    pub fn status(&self) -> EngineStatus {
        let state = if self.core.in_flight.load(Ordering::SeqCst) {
            EngineState::Syncing
        } else if self.is_running() {
            EngineState::Idle
        } else {
            EngineState::Stopped
        };
        EngineStatus {
            state,
            online: *self.core.online.read(),
            queue: self.core.queue.stats(),
            watermark: self.core.queue.watermark(),
            last_cycle: self.core.last_cycle.read().clone(),
            cycles_completed: self.core.cycles_completed.load(Ordering::SeqCst),
            cycles_skipped: self.core.cycles_skipped.load(Ordering::SeqCst),
        }
    }

    /// Dead-lettered records, oldest first.
    pub fn dead_letter_queue(&self, limit: usize) -> Vec<SyncRecord> {
        self.dead_letters.list(limit)
    }

    /// Gives one dead-lettered record a fresh retry budget.
    pub fn retry_dead_letter_item(&self, id: &SyncId) -> SyncResult<SyncRecord> {
        self.dead_letters.retry_one(id)
    }

    /// Gives every dead-lettered record a fresh retry budget.
    pub fn retry_all_dead_letter(&self) -> SyncResult<usize> {
        self.dead_letters.retry_all()
    }

    /// Deletes dead-lettered records.
    pub fn clear_dead_letter_items(&self, ids: &[SyncId]) -> SyncResult<usize> {
        self.dead_letters.purge(ids)
    }

    /// Dead letter manager of this engine.
    pub fn dead_letters(&self) -> &DeadLetterManager {
        &self.dead_letters
    }

    /// Queues a document for sync outside of change capture.
    ///
    /// Creates and updates snapshot the document's current version; deletes
    /// carry no payload.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnknownCollection`] for unregistered collections
    /// and [`SyncError::DocumentNotFound`] when a create or update names a
    /// missing document.
    pub fn queue_for_sync(
        &self,
        collection: &str,
        document_id: &str,
        operation: Operation,
    ) -> SyncResult<SyncRecord> {
        let store = self.core.applier.collection(collection)?;
        let payload = if operation.is_delete() {
            None
        } else {
            let mut document = store.get(document_id)?.ok_or_else(|| {
                SyncError::DocumentNotFound {
                    collection: collection.to_string(),
                    document_id: document_id.to_string(),
                }
            })?;
            strip_remote_origin(&mut document);
            Some(document)
        };

        let config = &self.core.config;
        let record = SyncRecord::new(
            &config.node_id,
            operation,
            collection,
            document_id,
            payload,
            self.core.clock.now(),
        )
        .with_priority(config.priorities.priority_of(collection));
        let record = self.core.queue.enqueue(record)?;

        info!(
            sync_id = %record.sync_id,
            collection,
            document_id,
            operation = %operation,
            "document queued for sync by operator"
        );
        Ok(record)
    }

    /// Settles a conflict by an operator's decision.
    pub fn resolve_conflict(
        &self,
        id: &SyncId,
        decision: ConflictDecision,
    ) -> SyncResult<ResolutionOutcome> {
        self.core.resolver.resolve_with(id, decision)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn tick_loop(core: Arc<EngineCore>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(core.config.sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut current: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if current.as_ref().is_some_and(|cycle| !cycle.is_finished()) {
                    core.note_skipped();
                    continue;
                }
                let core = Arc::clone(&core);
                current = Some(tokio::spawn(async move {
                    core.run_cycle().await;
                }));
            }
        }
    }

    if let Some(cycle) = current {
        if let Err(e) = cycle.await {
            warn!(error = %e, "sync cycle ended abnormally");
        }
    }
    debug!("scheduler loop stopped");
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    transport: Option<Arc<dyn CentralTransport>>,
    collections: Vec<Arc<dyn SyncCollection>>,
    queue: Option<Arc<SyncQueue>>,
    journal_path: Option<PathBuf>,
    clock: Option<Arc<dyn Clock>>,
}

impl SyncEngineBuilder {
    /// Creates a builder for `config`.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            transport: None,
            collections: Vec::new(),
            queue: None,
            journal_path: None,
            clock: None,
        }
    }

    /// Sets the connection to central.
    pub fn with_transport(mut self, transport: Arc<dyn CentralTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registers a syncable collection.
    pub fn with_collection(mut self, collection: Arc<dyn SyncCollection>) -> Self {
        self.collections.push(collection);
        self
    }

    /// Uses an existing queue.
    pub fn with_queue(mut self, queue: Arc<SyncQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Journals the queue to a file at `path`.
    pub fn with_journal_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    /// Sets the clock (the system clock by default).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the engine.
    ///
    /// Without a queue or journal file the queue lives in memory.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] for an invalid configuration, a missing
    /// transport or duplicate collection names, and storage errors from
    /// opening the journal.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let config = self.config;
        config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| SyncError::Config("a central transport is required".into()))?;

        let mut names = HashSet::new();
        for collection in &self.collections {
            if !names.insert(collection.name().to_string()) {
                return Err(SyncError::Config(format!(
                    "collection registered twice: {}",
                    collection.name()
                )));
            }
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let queue = match (self.queue, self.journal_path) {
            (Some(queue), _) => queue,
            (None, Some(path)) => Arc::new(SyncQueue::open_file(
                path,
                config.retry.clone(),
                config.error_history_cap,
                Arc::clone(&clock),
            )?),
            (None, None) => Arc::new(SyncQueue::in_memory(
                config.retry.clone(),
                config.error_history_cap,
                Arc::clone(&clock),
            )?),
        };

        let applier = Applier::new(&self.collections);
        let resolver = Arc::new(ConflictResolver::new(
            config.conflict_strategy,
            Arc::clone(&queue),
            applier.clone(),
            Arc::clone(&clock),
        ));
        let capture = Arc::new(ChangeCapture::new(
            &config,
            Arc::clone(&queue),
            self.collections,
            Arc::clone(&clock),
        ));
        let pusher = Pusher::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(&queue),
            Arc::clone(&resolver),
        );
        let puller = Puller::new(&config, transport, Arc::clone(&queue), applier.clone());

        info!(
            node_id = %config.node_id,
            strategy = %config.conflict_strategy,
            collections = names.len(),
            "sync engine built"
        );

        let dead_letters = DeadLetterManager::new(Arc::clone(&queue));
        Ok(SyncEngine {
            core: Arc::new(EngineCore {
                config,
                queue,
                capture,
                applier,
                resolver,
                pusher,
                puller,
                clock,
                in_flight: AtomicBool::new(false),
                cycles_completed: AtomicU64::new(0),
                cycles_skipped: AtomicU64::new(0),
                online: RwLock::new(None),
                last_cycle: RwLock::new(None),
            }),
            dead_letters,
            running: Mutex::new(None),
        })
    }
}
