//! Engine configuration.
//!
//! [`MemexConfig`] arrives from the embedding layer as a JSON document
//! (`init(config_json)`); every field has a default so a partial document or
//! `{}` is valid. Validation happens once at engine init and any violation is
//! `Error::BadConfig`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemexConfig {
    /// Path of the SQLite database file (WAL sidecars live next to it).
    pub database_path: String,
    /// Age in hours past which low-importance, never-accessed memories are swept.
    pub default_memory_ttl_hours: u32,
    /// Run the decay pass on a background timer.
    pub auto_decay_enabled: bool,
    pub decay_interval_hours: u32,
    /// Allow the decay pass to truncate old low-importance content (lossy).
    pub enable_compression: bool,
    pub max_memories_per_user: u32,
    /// Importance floor for the decay sweep, in [0, 1].
    pub importance_threshold: f64,
    pub enable_request_limits: bool,
    pub max_requests_per_minute: u32,
    pub max_batch_size: u32,
    /// When saving would breach the quota, evict the least valuable rows
    /// instead of failing. Off by default: callers opt in.
    pub auto_evict_enabled: bool,
    /// Size of the reader connection pool. Writes always serialize on one
    /// connection.
    pub max_readers: u32,
    /// SQLite page cache per connection, in KiB.
    pub cache_size_kib: u32,
    pub busy_timeout_ms: u32,
}

impl Default for MemexConfig {
    fn default() -> Self {
        Self {
            database_path: "./memex.db".into(),
            default_memory_ttl_hours: 720,
            auto_decay_enabled: true,
            decay_interval_hours: 24,
            enable_compression: true,
            max_memories_per_user: 10_000,
            importance_threshold: 0.3,
            enable_request_limits: true,
            max_requests_per_minute: 1_000,
            max_batch_size: 100,
            auto_evict_enabled: false,
            max_readers: 8,
            cache_size_kib: 262_144,
            busy_timeout_ms: 30_000,
        }
    }
}

impl MemexConfig {
    /// Parse a JSON config document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: MemexConfig = serde_json::from_str(json)
            .map_err(|e| Error::BadConfig(format!("failed to parse config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.trim().is_empty() {
            return Err(Error::BadConfig("database_path must not be empty".into()));
        }
        if !(1..=8760).contains(&self.default_memory_ttl_hours) {
            return Err(Error::BadConfig(
                "default_memory_ttl_hours must be in 1..=8760".into(),
            ));
        }
        if !(1..=168).contains(&self.decay_interval_hours) {
            return Err(Error::BadConfig(
                "decay_interval_hours must be in 1..=168".into(),
            ));
        }
        if !(1..=1_000_000).contains(&self.max_memories_per_user) {
            return Err(Error::BadConfig(
                "max_memories_per_user must be in 1..=1000000".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.importance_threshold) {
            return Err(Error::BadConfig(
                "importance_threshold must be in [0.0, 1.0]".into(),
            ));
        }
        if !(1..=100_000).contains(&self.max_requests_per_minute) {
            return Err(Error::BadConfig(
                "max_requests_per_minute must be in 1..=100000".into(),
            ));
        }
        if !(1..=1000).contains(&self.max_batch_size) {
            return Err(Error::BadConfig("max_batch_size must be in 1..=1000".into()));
        }
        if !(1..=64).contains(&self.max_readers) {
            return Err(Error::BadConfig("max_readers must be in 1..=64".into()));
        }
        if self.cache_size_kib == 0 {
            return Err(Error::BadConfig("cache_size_kib must be positive".into()));
        }
        if self.busy_timeout_ms == 0 {
            return Err(Error::BadConfig("busy_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
