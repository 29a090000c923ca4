//! Download configuration constants

use std::time::Duration;

/// Maximum number of retries after a transient failure of one fetch unit.
/// With the backoff below the worst case spends about a minute on one unit
/// before it is recorded as failed and the span moves on.
pub const MAX_RETRIES: u32 = 5;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
/// Retry 5 would be 32s and is capped to 30s.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Length of PVOutput's rate-limit window.
pub const QUOTA_WINDOW_SECS: i64 = 60 * 60;

/// Extra wait added to the provider's reset time after a quota rejection.
/// The reset header is only second-accurate and the server clock drifts.
pub const QUOTA_EXHAUSTION_GRACE_SECS: i64 = 3 * 60;

/// Delay between polls of a batch request the data service accepted
/// but has not finished preparing ("Accepted 202").
pub const BATCH_POLL_INTERVAL_SECS: u64 = 60;

/// Polls of one accepted batch request before it is recorded as failed.
pub const MAX_BATCH_POLLS: u32 = 60;

/// Days returned by one `getbatchstatus` call: the requested date and the 365 before it.
pub const BATCH_WINDOW_DAYS: u32 = 366;

/// Calculate exponential backoff delay
pub fn calculate_backoff(retry_count: u32) -> Duration {
    let delay_ms = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(retry_count));
    let delay_ms = delay_ms.min(MAX_BACKOFF_MS);
    Duration::from_millis(delay_ms)
}

/// Retry and polling limits applied per fetch unit.
///
/// Quota rejections never count against these limits. They are retried
/// once the window resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after transient errors before the unit is recorded as failed
    pub max_retries: u32,
    /// Polls of an accepted batch request before the unit is recorded as failed
    pub max_polls: u32,
    /// Delay between polls of an accepted batch request
    pub poll_interval: Duration,
}

impl RetryPolicy {
    /// Policy with a custom retry ceiling and default polling.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        calculate_backoff(retry.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            max_polls: MAX_BATCH_POLLS,
            poll_interval: Duration::from_secs(BATCH_POLL_INTERVAL_SECS),
        }
    }
}
