//! Time source for the orchestrator

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Wall clock plus the ability to sleep until an instant.
///
/// Quota windows last an hour, so tests substitute a clock whose
/// `sleep_until` simply jumps forward.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Suspend until `deadline`. Returns immediately if it has passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// Real time, sleeping on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        if let Ok(remaining) = (deadline - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
    }
}
