//! Engine configuration.
//!
//! All tunables live here with serde defaults so a partial JSON config can
//! override individual fields. The chapter-split tolerance is deliberately
//! configurable: it is the primary source of audible chapter-boundary
//! drift, so callers may want to tighten it per source.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of simultaneously in-flight segment fetches per downloader.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default chapter-split tolerance in seconds.
pub const DEFAULT_SPLIT_TOLERANCE_SECS: f64 = 0.5;

/// Default maximum number of book subprocesses launched by the supervisor.
pub const DEFAULT_MAX_PARALLEL_BOOKS: usize = 5;

/// Tunables for the download engine and its coordination layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on simultaneous in-flight HTTP fetches per downloader.
    pub concurrency: usize,

    /// Connect timeout for segment fetches, in seconds.
    pub connect_timeout_secs: u64,

    /// Read timeout for segment fetches, in seconds. A fetch that exceeds
    /// this counts as a transfer error rather than hanging the scheduler.
    pub read_timeout_secs: u64,

    /// Remaining-gap tolerance (seconds) below which the current chapter is
    /// considered complete during merged-stream assembly.
    pub split_tolerance_secs: f64,

    /// Transcode merged chapters from MPEG-TS to mp3 with ffmpeg. When
    /// false the concatenated stream is written as-is (the segment payload
    /// of most sources is already MPEG audio).
    pub transcode: bool,

    /// Poll interval for job status files, in milliseconds.
    pub poll_interval_ms: u64,

    /// How long a job file may go without an update before the supervisor
    /// treats the job as dead, in seconds.
    pub stale_after_secs: u64,

    /// Grace period after an abnormal client disconnect before the
    /// coordinator cancels downloads and shuts down, in seconds.
    pub grace_period_secs: u64,

    /// Maximum number of book subprocesses running at once.
    pub max_parallel_books: usize,

    /// Directory holding job status files. Defaults to `jobs` under the
    /// current directory when unset.
    pub jobs_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            connect_timeout_secs: 30,
            read_timeout_secs: 240,
            split_tolerance_secs: DEFAULT_SPLIT_TOLERANCE_SECS,
            transcode: true,
            poll_interval_ms: 1000,
            stale_after_secs: 30,
            grace_period_secs: 60,
            max_parallel_books: DEFAULT_MAX_PARALLEL_BOOKS,
            jobs_dir: None,
        }
    }
}

impl EngineConfig {
    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Staleness window as a [`Duration`].
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Reconnect grace period as a [`Duration`].
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Directory for job status files.
    #[must_use]
    pub fn jobs_dir(&self) -> PathBuf {
        self.jobs_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("jobs"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert!((config.split_tolerance_secs - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.grace_period(), Duration::from_secs(60));
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.max_parallel_books, 5);
        assert!(config.transcode);
    }

    #[test]
    fn test_partial_json_overrides_single_field() {
        let config: EngineConfig = serde_json::from_str(r#"{"concurrency": 2}"#).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.grace_period_secs, 60);
    }
}
