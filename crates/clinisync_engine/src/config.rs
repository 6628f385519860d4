//! Configuration for the sync engine.
//!
//! Built in code with `with_*` methods or loaded from TOML:
//!
//! ```toml
//! node_id = "clinic-kisumu"
//! central_url = "https://central.example.org"
//! credential = "node-secret"
//! sync_interval_ms = 30000
//! conflict_strategy = "last-write-wins"
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 1000
//!
//! [priorities]
//! referrals = 2
//! ```

use crate::error::{SyncError, SyncResult};
use clinisync_protocol::ConflictStrategy;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Priority of collections not listed in the table.
pub const DEFAULT_PRIORITY: u8 = 5;

const DEFAULT_PRIORITIES: &[(&str, u8)] = &[
    // identity / person data
    ("patients", 1),
    ("users", 1),
    ("staff", 1),
    ("contacts", 1),
    // scheduling
    ("appointments", 2),
    ("visits", 2),
    ("queue_entries", 2),
    ("schedules", 2),
    // clinical
    ("consultations", 3),
    ("prescriptions", 3),
    ("exams", 3),
    ("lab_results", 3),
    ("surgeries", 3),
    ("ivt_injections", 3),
    ("medical_records", 3),
    // financial
    ("invoices", 4),
    ("payments", 4),
    ("insurance_claims", 4),
];

/// Static per-collection priority table; lower is more urgent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityTable {
    entries: HashMap<String, u8>,
    fallback: u8,
}

impl PriorityTable {
    /// Creates an empty table where every collection gets `fallback`.
    pub fn empty(fallback: u8) -> Self {
        Self {
            entries: HashMap::new(),
            fallback,
        }
    }

    /// Sets the priority of a collection.
    pub fn with(mut self, collection: impl Into<String>, priority: u8) -> Self {
        self.entries.insert(collection.into(), priority);
        self
    }

    /// Returns the priority of a collection.
    pub fn priority_of(&self, collection: &str) -> u8 {
        self.entries.get(collection).copied().unwrap_or(self.fallback)
    }

    /// Number of explicitly listed collections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no collection is listed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        DEFAULT_PRIORITIES
            .iter()
            .fold(Self::empty(DEFAULT_PRIORITY), |table, (name, p)| {
                table.with(*name, *p)
            })
    }
}

/// Configuration for queue-level retry and backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts after which a record is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound of any delay.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration with default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: Duration::from_secs(1),
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter bound.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the `attempts`-th failure with a given jitter sample:
    /// `min(base * 2^(attempts-1) + jitter, cap)`.
    pub fn delay_for_attempt(&self, attempts: u32, jitter: Duration) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(31);
        let exponential = self.base_delay.saturating_mul(1u32 << exponent);
        exponential.saturating_add(jitter).min(self.max_delay)
    }

    /// Draws a jitter sample uniformly from `0..=jitter`.
    pub fn sample_jitter(&self) -> Duration {
        let bound = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }

    /// Backoff after the `attempts`-th failure, never shorter than `previous`.
    pub fn next_backoff(&self, attempts: u32, previous: Duration) -> Duration {
        self.delay_for_attempt(attempts, self.sample_jitter())
            .max(previous.min(self.max_delay))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Timeouts applied to each central call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Liveness probe.
    pub health: Duration,
    /// Single-item push.
    pub push: Duration,
    /// Pull page.
    pub pull: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(5),
            push: Duration::from_secs(10),
            pull: Duration::from_secs(30),
        }
    }
}

/// Configuration for a node's sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of this node (clinic).
    pub node_id: String,
    /// Base URL of the central authority.
    pub central_url: String,
    /// Bearer credential sent with every request.
    pub credential: Option<String>,
    /// Interval between scheduled cycles.
    pub sync_interval: Duration,
    /// Records pushed concurrently per batch.
    pub push_concurrency: usize,
    /// Maximum records drained per push phase.
    pub push_batch_limit: usize,
    /// Pause between push batches.
    pub batch_delay: Duration,
    /// Retries of a transient failure within one attempt.
    pub request_retries: u32,
    /// Pause before an in-attempt retry (multiplied by the retry number).
    pub request_retry_delay: Duration,
    /// Queue-level retry and backoff.
    pub retry: RetryConfig,
    /// Entries kept in a record's error history.
    pub error_history_cap: usize,
    /// Changes requested per pull page.
    pub pull_page_size: u32,
    /// Pages fetched per cycle at most.
    pub max_pull_pages: u32,
    /// Network timeouts.
    pub timeouts: Timeouts,
    /// Fallback interval at which capture polls each collection feed.
    pub capture_poll_interval: Duration,
    /// Events processed per capture batch.
    pub capture_batch_size: usize,
    /// Engine-wide conflict strategy.
    pub conflict_strategy: ConflictStrategy,
    /// Per-collection priorities.
    pub priorities: PriorityTable,
}

impl SyncConfig {
    /// Creates a configuration with defaults for everything but identity.
    pub fn new(node_id: impl Into<String>, central_url: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            central_url: central_url.into(),
            credential: None,
            sync_interval: Duration::from_secs(30),
            push_concurrency: 3,
            push_batch_limit: 100,
            batch_delay: Duration::from_millis(100),
            request_retries: 2,
            request_retry_delay: Duration::from_millis(250),
            retry: RetryConfig::default(),
            error_history_cap: 10,
            pull_page_size: 100,
            max_pull_pages: 10,
            timeouts: Timeouts::default(),
            capture_poll_interval: Duration::from_secs(1),
            capture_batch_size: 100,
            conflict_strategy: ConflictStrategy::default(),
            priorities: PriorityTable::default(),
        }
    }

    /// Sets the node credential.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Sets the sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the push concurrency.
    pub fn with_push_concurrency(mut self, concurrency: usize) -> Self {
        self.push_concurrency = concurrency;
        self
    }

    /// Sets the maximum number of records drained per push phase.
    pub fn with_push_batch_limit(mut self, limit: usize) -> Self {
        self.push_batch_limit = limit;
        self
    }

    /// Sets the delay between push batches.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Sets the in-attempt retry count and delay.
    pub fn with_request_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.request_retries = retries;
        self.request_retry_delay = delay;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the error history cap.
    pub fn with_error_history_cap(mut self, cap: usize) -> Self {
        self.error_history_cap = cap;
        self
    }

    /// Sets the pull page size and page limit.
    pub fn with_pull_paging(mut self, page_size: u32, max_pages: u32) -> Self {
        self.pull_page_size = page_size;
        self.max_pull_pages = max_pages;
        self
    }

    /// Sets the network timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the capture poll interval.
    pub fn with_capture_poll_interval(mut self, interval: Duration) -> Self {
        self.capture_poll_interval = interval;
        self
    }

    /// Sets the conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Sets the priority table.
    pub fn with_priorities(mut self, priorities: PriorityTable) -> Self {
        self.priorities = priorities;
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(SyncError::Config("node_id must not be empty".into()));
        }
        if self.push_concurrency == 0 {
            return Err(SyncError::Config("push_concurrency must be at least 1".into()));
        }
        if self.push_batch_limit == 0 {
            return Err(SyncError::Config("push_batch_limit must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(SyncError::Config(
                "retry.max_delay must not be below retry.base_delay".into(),
            ));
        }
        if self.error_history_cap == 0 {
            return Err(SyncError::Config("error_history_cap must be at least 1".into()));
        }
        if self.pull_page_size == 0 || self.max_pull_pages == 0 {
            return Err(SyncError::Config("pull paging values must be at least 1".into()));
        }
        if self.sync_interval.is_zero() {
            return Err(SyncError::Config("sync_interval must be positive".into()));
        }
        if self.capture_batch_size == 0 {
            return Err(SyncError::Config("capture_batch_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Parses a TOML document and validates the result.
    pub fn from_toml_str(source: &str) -> SyncResult<Self> {
        let file: ConfigFile =
            toml::from_str(source).map_err(|e| SyncError::Config(e.to_string()))?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    node_id: String,
    central_url: String,
    credential: Option<String>,
    sync_interval_ms: Option<u64>,
    push_concurrency: Option<usize>,
    push_batch_limit: Option<usize>,
    batch_delay_ms: Option<u64>,
    request_retries: Option<u32>,
    request_retry_delay_ms: Option<u64>,
    error_history_cap: Option<usize>,
    pull_page_size: Option<u32>,
    max_pull_pages: Option<u32>,
    capture_poll_interval_ms: Option<u64>,
    capture_batch_size: Option<usize>,
    conflict_strategy: Option<ConflictStrategy>,
    #[serde(default)]
    retry: RetryFile,
    #[serde(default)]
    timeouts: TimeoutsFile,
    #[serde(default)]
    priorities: HashMap<String, u8>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryFile {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    jitter_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimeoutsFile {
    health_ms: Option<u64>,
    push_ms: Option<u64>,
    pull_ms: Option<u64>,
}

impl ConfigFile {
    fn into_config(self) -> SyncConfig {
        let ms = Duration::from_millis;
        let mut config = SyncConfig::new(self.node_id, self.central_url);

        config.credential = self.credential;
        if let Some(v) = self.sync_interval_ms {
            config.sync_interval = ms(v);
        }
        if let Some(v) = self.push_concurrency {
            config.push_concurrency = v;
        }
        if let Some(v) = self.push_batch_limit {
            config.push_batch_limit = v;
        }
        if let Some(v) = self.batch_delay_ms {
            config.batch_delay = ms(v);
        }
        if let Some(v) = self.request_retries {
            config.request_retries = v;
        }
        if let Some(v) = self.request_retry_delay_ms {
            config.request_retry_delay = ms(v);
        }
        if let Some(v) = self.error_history_cap {
            config.error_history_cap = v;
        }
        if let Some(v) = self.pull_page_size {
            config.pull_page_size = v;
        }
        if let Some(v) = self.max_pull_pages {
            config.max_pull_pages = v;
        }
        if let Some(v) = self.capture_poll_interval_ms {
            config.capture_poll_interval = ms(v);
        }
        if let Some(v) = self.capture_batch_size {
            config.capture_batch_size = v;
        }
        if let Some(v) = self.conflict_strategy {
            config.conflict_strategy = v;
        }

        if let Some(v) = self.retry.max_attempts {
            config.retry.max_attempts = v;
        }
        if let Some(v) = self.retry.base_delay_ms {
            config.retry.base_delay = ms(v);
        }
        if let Some(v) = self.retry.max_delay_ms {
            config.retry.max_delay = ms(v);
        }
        if let Some(v) = self.retry.jitter_ms {
            config.retry.jitter = ms(v);
        }

        if let Some(v) = self.timeouts.health_ms {
            config.timeouts.health = ms(v);
        }
        if let Some(v) = self.timeouts.push_ms {
            config.timeouts.push = ms(v);
        }
        if let Some(v) = self.timeouts.pull_ms {
            config.timeouts.pull = ms(v);
        }

        config.priorities = self
            .priorities
            .into_iter()
            .fold(config.priorities, |table, (name, p)| table.with(name, p));
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("clinic-1", "https://central.example.org")
            .with_credential("secret")
            .with_push_concurrency(5)
            .with_pull_paging(50, 4)
            .with_conflict_strategy(ConflictStrategy::Manual);

        assert_eq!(config.node_id, "clinic-1");
        assert_eq!(config.credential.as_deref(), Some("secret"));
        assert_eq!(config.push_concurrency, 5);
        assert_eq!(config.pull_page_size, 50);
        assert_eq!(config.max_pull_pages, 4);
        assert_eq!(config.conflict_strategy, ConflictStrategy::Manual);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_priorities() {
        let table = PriorityTable::default();
        assert_eq!(table.priority_of("patients"), 1);
        assert_eq!(table.priority_of("appointments"), 2);
        assert_eq!(table.priority_of("prescriptions"), 3);
        assert_eq!(table.priority_of("invoices"), 4);
        assert_eq!(table.priority_of("audit_notes"), DEFAULT_PRIORITY);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let base = SyncConfig::new("clinic-1", "http://central");

        assert!(base.clone().with_push_concurrency(0).validate().is_err());
        assert!(SyncConfig::new(" ", "http://central").validate().is_err());
        assert!(base
            .clone()
            .with_retry(RetryConfig::new(0))
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_retry(
                RetryConfig::new(3)
                    .with_base_delay(Duration::from_secs(10))
                    .with_max_delay(Duration::from_secs(1))
            )
            .validate()
            .is_err());
    }

    #[test]
    fn delay_doubles_until_cap() {
        let retry = RetryConfig::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1));

        assert_eq!(retry.delay_for_attempt(0, Duration::ZERO), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1, Duration::ZERO), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2, Duration::ZERO), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(4, Duration::ZERO), Duration::from_millis(800));
        assert_eq!(retry.delay_for_attempt(5, Duration::ZERO), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(60, Duration::ZERO), Duration::from_secs(1));
        assert_eq!(
            retry.delay_for_attempt(1, Duration::from_millis(30)),
            Duration::from_millis(130)
        );
    }

    #[test]
    fn jitter_disabled() {
        let retry = RetryConfig::new(3).with_jitter(Duration::ZERO);
        assert_eq!(retry.sample_jitter(), Duration::ZERO);
    }

    #[test]
    fn load_from_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            node_id = "clinic-kisumu"
            central_url = "https://central.example.org"
            credential = "node-secret"
            sync_interval_ms = 15000
            push_concurrency = 4
            conflict_strategy = "central-wins"

            [retry]
            max_attempts = 7
            base_delay_ms = 500
            jitter_ms = 0

            [timeouts]
            pull_ms = 60000

            [priorities]
            referrals = 2
            patients = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id, "clinic-kisumu");
        assert_eq!(config.sync_interval, Duration::from_secs(15));
        assert_eq!(config.push_concurrency, 4);
        assert_eq!(config.conflict_strategy, ConflictStrategy::CentralWins);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.retry.jitter, Duration::ZERO);
        assert_eq!(config.timeouts.pull, Duration::from_secs(60));
        assert_eq!(config.timeouts.push, Timeouts::default().push);
        assert_eq!(config.priorities.priority_of("referrals"), 2);
        assert_eq!(config.priorities.priority_of("patients"), 3);
        assert_eq!(config.priorities.priority_of("invoices"), 4);
    }

    #[test]
    fn toml_errors_are_config_errors() {
        assert!(matches!(
            SyncConfig::from_toml_str("node_id = \"x\""),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            SyncConfig::from_toml_str(
                "node_id = \"x\"\ncentral_url = \"y\"\npush_concurency = 2"
            ),
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            SyncConfig::from_toml_str("node_id = \"x\"\ncentral_url = \"y\"\npush_concurrency = 0"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "node_id = \"clinic-2\"\ncentral_url = \"http://c\"\n").unwrap();

        let config = SyncConfig::from_file(&path).unwrap();
        assert_eq!(config.node_id, "clinic-2");
        assert!(SyncConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..5_000,
            cap_factor in 1u64..64,
            jitter_ms in 0u64..2_000,
            failures in 1u32..40,
        ) {
            let cap = Duration::from_millis(base_ms * cap_factor);
            let retry = RetryConfig::new(failures + 1)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(cap)
                .with_jitter(Duration::from_millis(jitter_ms));

            let mut previous = Duration::ZERO;
            for attempt in 1..=failures {
                let next = retry.next_backoff(attempt, previous);
                prop_assert!(next >= previous);
                prop_assert!(next <= cap);
                previous = next;
            }
        }
    }
}
