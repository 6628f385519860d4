//! Central configuration.

/// Configuration for the central authority.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    /// Maximum changes returned by one pull.
    pub max_pull_batch: u32,
    /// Maximum encoded size of a pushed document.
    pub max_payload_bytes: usize,
}

impl CentralConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_pull_batch: 100,
            max_payload_bytes: 1024 * 1024,
        }
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size;
        self
    }

    /// Sets the maximum pushed document size.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self::new()
    }
}
