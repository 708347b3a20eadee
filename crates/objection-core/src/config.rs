//! Engine configuration.
//!
//! Provides [`EngineConfig`] for configuring the storage engine.
//! Configuration values are loaded from `OBJECTION_*` environment
//! variables with sensible defaults for local development.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Storage engine configuration.
///
/// # Examples
///
/// ```
/// use objection_core::config::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.max_commit_attempts, 8);
/// assert_eq!(config.spill_threshold, 524_288);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Data directory for durable payload and metadata files.
    #[builder(default = String::from("/var/lib/objection"))]
    pub data_dir: String,

    /// Maximum payload size (in bytes) kept entirely in memory before
    /// spilling to disk.
    #[builder(default = 524_288)]
    pub spill_threshold: usize,

    /// Total payload byte budget. `None` disables capacity enforcement.
    #[builder(default = None)]
    pub capacity_bytes: Option<u64>,

    /// Maximum number of CAS commit attempts before surfacing
    /// [`crate::error::EngineError::WriteConflict`].
    #[builder(default = 8)]
    pub max_commit_attempts: u32,

    /// Base backoff between CAS commit attempts, in milliseconds. Jitter is
    /// added per attempt.
    #[builder(default = 5)]
    pub commit_backoff_ms: u64,

    /// How long an inactive multipart upload session lives before the
    /// reaper aborts it, in seconds.
    #[builder(default = 86_400)]
    pub upload_session_ttl_secs: u64,

    /// How long a completed-upload tombstone is kept for idempotent
    /// completion retries, in seconds.
    #[builder(default = 3_600)]
    pub upload_tombstone_ttl_secs: u64,

    /// Interval between background reaper passes, in seconds.
    #[builder(default = 60)]
    pub reaper_interval_secs: u64,

    /// Log level filter string (e.g. `"info"`, `"debug"`).
    #[builder(default = String::from("info"))]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: String::from("/var/lib/objection"),
            spill_threshold: 524_288,
            capacity_bytes: None,
            max_commit_attempts: 8,
            commit_backoff_ms: 5,
            upload_session_ttl_secs: 86_400,
            upload_tombstone_ttl_secs: 3_600,
            reaper_interval_secs: 60,
            log_level: String::from("info"),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Reads the following variables (falling back to defaults):
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OBJECTION_DATA_DIR` | `/var/lib/objection` |
    /// | `OBJECTION_SPILL_THRESHOLD` | `524288` |
    /// | `OBJECTION_CAPACITY_BYTES` | unset (unlimited) |
    /// | `OBJECTION_MAX_COMMIT_ATTEMPTS` | `8` |
    /// | `OBJECTION_COMMIT_BACKOFF_MS` | `5` |
    /// | `OBJECTION_UPLOAD_SESSION_TTL_SECS` | `86400` |
    /// | `OBJECTION_UPLOAD_TOMBSTONE_TTL_SECS` | `3600` |
    /// | `OBJECTION_REAPER_INTERVAL_SECS` | `60` |
    /// | `OBJECTION_LOG_LEVEL` | `info` |
    ///
    /// # Examples
    ///
    /// ```
    /// use objection_core::config::EngineConfig;
    ///
    /// let config = EngineConfig::from_env();
    /// assert!(!config.data_dir.is_empty());
    /// ```
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("OBJECTION_DATA_DIR") {
            config.data_dir = v;
        }
        if let Ok(v) = std::env::var("OBJECTION_SPILL_THRESHOLD") {
            if let Ok(n) = v.parse::<usize>() {
                config.spill_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("OBJECTION_CAPACITY_BYTES") {
            if let Ok(n) = v.parse::<u64>() {
                config.capacity_bytes = Some(n);
            }
        }
        if let Ok(v) = std::env::var("OBJECTION_MAX_COMMIT_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                config.max_commit_attempts = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("OBJECTION_COMMIT_BACKOFF_MS") {
            if let Ok(n) = v.parse::<u64>() {
                config.commit_backoff_ms = n;
            }
        }
        if let Ok(v) = std::env::var("OBJECTION_UPLOAD_SESSION_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                config.upload_session_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("OBJECTION_UPLOAD_TOMBSTONE_TTL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                config.upload_tombstone_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("OBJECTION_REAPER_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                config.reaper_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("OBJECTION_LOG_LEVEL") {
            config.log_level = v;
        }

        config
    }
}
