//! Backoff schedule for failed transfers.
//!
//! A [`RetryPolicy`] looks at the [`TransferError`] itself and answers one
//! question: how long to wait before the next attempt, if at all. Delays
//! double per attempt with random jitter so parallel segment fetches that
//! fail together do not retry together.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::TransferError;

/// Default maximum attempts per transfer (including the first).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First retry waits this long; each further retry doubles it.
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Doubling stops here (32 seconds).
const MAX_DELAY: Duration = Duration::from_secs(32);

/// Up to this much random jitter is added to every delay.
const MAX_JITTER_MS: u64 = 500;

/// How a failed transfer should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on another attempt (timeout, 5xx, truncated body).
    Transient,

    /// Will keep failing no matter how often it is retried
    /// (4xx, malformed URL, local IO, TLS).
    Permanent,

    /// HTTP 429. Retried on the same schedule as transient failures.
    RateLimited,
}

impl FailureType {
    /// Classifies a transfer error.
    pub fn of(error: &TransferError) -> Self {
        match error {
            TransferError::HttpStatus { status, .. } => Self::of_status(*status),

            TransferError::Timeout { .. } | TransferError::Truncated { .. } => Self::Transient,

            // TLS trouble will not clear up on its own; other network
            // errors (reset, refused, DNS) often do.
            TransferError::Network { source, .. } if is_tls_error(source) => Self::Permanent,
            TransferError::Network { .. } => Self::Transient,

            TransferError::Io { .. }
            | TransferError::InvalidUrl { .. }
            | TransferError::Client { .. } => Self::Permanent,
        }
    }

    fn of_status(status: u16) -> Self {
        match status {
            408 => Self::Transient,
            429 => Self::RateLimited,
            400..=499 => Self::Permanent,
            500..=599 => Self::Transient,
            _ => Self::Permanent,
        }
    }

    fn retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

/// Exponential backoff with a fixed attempt budget.
///
/// Delays run 1s, 2s, 4s, ... capped at 32s, each padded with up to
/// half a second of jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with a custom attempt budget (minimum 1).
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay before the next attempt, or `None` when the
    /// failure is permanent or the attempt budget is spent.
    ///
    /// `failed_attempt` is 1-indexed: the first request that fails is
    /// attempt 1 and earns the base delay.
    pub fn backoff(&self, error: &TransferError, failed_attempt: u32) -> Option<Duration> {
        if !FailureType::of(error).retryable() {
            debug!(%error, "permanent failure, not retrying");
            return None;
        }
        if failed_attempt >= self.max_attempts {
            debug!(failed_attempt, max = self.max_attempts, "attempt budget spent");
            return None;
        }

        // The shift is clamped one doubling past the cap, so large
        // attempt numbers cannot overflow.
        let exponent = failed_attempt.saturating_sub(1).min(6);
        let delay = BASE_DELAY.saturating_mul(1 << exponent).min(MAX_DELAY);
        let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
        Some(delay + Duration::from_millis(jitter))
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
