//! Engine configuration.
//!
//! Every timing constant the engine uses lives here. Defaults are tuned for
//! an interactive client; the daemon can override them from the environment.

use crate::{Error, Result};
use std::time::Duration;

/// Timing and batching configuration shared by all engine components.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window over which repository diffs are coalesced before delivery.
    pub diff_debounce: Duration,

    /// Delay between the first queued load request and the queue flush.
    pub request_flush_delay: Duration,

    /// Timeout applied to load requests that do not set their own.
    pub request_timeout: Duration,

    /// Maximum number of events handed to a global projection handler at once.
    pub global_batch_size: usize,

    /// Window over which events are buffered for global projection handlers.
    pub global_batch_window: Duration,

    /// How long a reply whose parent is unknown may still be re-grouped.
    pub orphan_defer: Duration,

    /// How long stale notes in an otherwise recent batch are held back.
    pub ancient_defer: Duration,

    /// Age beyond which a note counts as stale for feed ordering.
    pub recency_cutoff: Duration,

    /// Number of notes requested per cursor for the first feed page.
    pub feed_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            diff_debounce: Duration::from_millis(300),
            request_flush_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(15),
            global_batch_size: 500,
            global_batch_window: Duration::from_millis(300),
            orphan_defer: Duration::from_millis(1500),
            ancient_defer: Duration::from_secs(4),
            recency_cutoff: Duration::from_secs(6 * 3600),
            feed_page_size: 50,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional; durations are in milliseconds.
    ///
    /// - `HEARTH_DIFF_DEBOUNCE_MS` (default: 300)
    /// - `HEARTH_REQUEST_FLUSH_MS` (default: 500)
    /// - `HEARTH_REQUEST_TIMEOUT_MS` (default: 15000)
    /// - `HEARTH_GLOBAL_BATCH_SIZE` (default: 500)
    /// - `HEARTH_GLOBAL_BATCH_MS` (default: 300)
    /// - `HEARTH_ORPHAN_DEFER_MS` (default: 1500)
    /// - `HEARTH_ANCIENT_DEFER_MS` (default: 4000)
    /// - `HEARTH_RECENCY_CUTOFF_MS` (default: 21600000)
    /// - `HEARTH_FEED_PAGE_SIZE` (default: 50)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            diff_debounce: env_millis("HEARTH_DIFF_DEBOUNCE_MS", defaults.diff_debounce)?,
            request_flush_delay: env_millis("HEARTH_REQUEST_FLUSH_MS", defaults.request_flush_delay)?,
            request_timeout: env_millis("HEARTH_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            global_batch_size: env_count("HEARTH_GLOBAL_BATCH_SIZE", defaults.global_batch_size)?,
            global_batch_window: env_millis("HEARTH_GLOBAL_BATCH_MS", defaults.global_batch_window)?,
            orphan_defer: env_millis("HEARTH_ORPHAN_DEFER_MS", defaults.orphan_defer)?,
            ancient_defer: env_millis("HEARTH_ANCIENT_DEFER_MS", defaults.ancient_defer)?,
            recency_cutoff: env_millis("HEARTH_RECENCY_CUTOFF_MS", defaults.recency_cutoff)?,
            feed_page_size: env_count("HEARTH_FEED_PAGE_SIZE", defaults.feed_page_size)?,
        };

        if config.global_batch_size == 0 {
            return Err(Error::Config(
                "HEARTH_GLOBAL_BATCH_SIZE must be at least 1".to_string(),
            ));
        }

        tracing::info!(
            diff_debounce_ms = config.diff_debounce.as_millis() as u64,
            request_flush_ms = config.request_flush_delay.as_millis() as u64,
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            global_batch_size = config.global_batch_size,
            feed_page_size = config.feed_page_size,
            "engine configuration loaded"
        );

        Ok(config)
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| Error::Config(format!("{key} must be a number of milliseconds"))),
        Err(_) => Ok(default),
    }
}

fn env_count(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::Config(format!("{key} must be a non-negative integer"))),
        Err(_) => Ok(default),
    }
}
