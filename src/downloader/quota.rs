//! Request quota accounting
//!
//! PVOutput limits every API key to a fixed number of requests per rolling
//! hour. The [`QuotaGovernor`] keeps a local [`QuotaWindow`] so the engine can
//! stop before it hits the limit instead of burning requests on rejections.
//!
//! The governor never sleeps. [`QuotaGovernor::reserve`] answers immediately
//! with either [`Reservation::Granted`] or the instant the window reopens, and
//! the caller decides how to wait. Time is always passed in, which keeps the
//! accounting deterministic under test.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::{QUOTA_EXHAUSTION_GRACE_SECS, QUOTA_WINDOW_SECS};
use crate::fetcher::pvoutput_config::QuotaTier;
use crate::fetcher::ProviderQuota;

/// Quota parameters for one API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    /// Requests allowed per window
    pub max_requests_per_window: u32,
    /// Window length
    pub window: Duration,
    /// Extra wait added after a provider-reported exhaustion
    pub exhaustion_grace: Duration,
}

impl QuotaConfig {
    /// Hourly window with the given request ceiling.
    pub fn new(max_requests_per_window: u32) -> Self {
        Self {
            max_requests_per_window,
            window: Duration::seconds(QUOTA_WINDOW_SECS),
            exhaustion_grace: Duration::seconds(QUOTA_EXHAUSTION_GRACE_SECS),
        }
    }

    /// Preset for an account tier.
    pub fn for_tier(tier: QuotaTier) -> Self {
        Self::new(tier.requests_per_hour())
    }

    /// Override the grace period added after exhaustion.
    pub fn with_exhaustion_grace(mut self, grace: Duration) -> Self {
        self.exhaustion_grace = grace;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_requests_per_window == 0 {
            return Err("max requests per window must be at least 1".to_string());
        }
        if self.window <= Duration::zero() {
            return Err("quota window must be positive".to_string());
        }
        if self.exhaustion_grace < Duration::zero() {
            return Err("exhaustion grace cannot be negative".to_string());
        }
        Ok(())
    }
}

/// Requests made in the current window and when it resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaWindow {
    requests_made: u32,
    reset_at: DateTime<Utc>,
    max_requests: u32,
}

impl QuotaWindow {
    /// Requests counted against this window
    pub fn requests_made(&self) -> u32 {
        self.requests_made
    }

    /// Instant the window rolls over
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Configured ceiling
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Requests still available before the reset
    pub fn remaining(&self) -> u32 {
        self.max_requests.saturating_sub(self.requests_made)
    }

    /// Whether no request can be made before the reset
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

/// Answer to a reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Capacity was available and one request has been counted
    Granted,
    /// No capacity until the given instant
    MustWaitUntil(DateTime<Utc>),
}

/// Tracks the provider's request quota.
#[derive(Debug, Clone)]
pub struct QuotaGovernor {
    config: QuotaConfig,
    window: QuotaWindow,
}

impl QuotaGovernor {
    /// Start with a fresh window opening at `now`.
    pub fn new(config: QuotaConfig, now: DateTime<Utc>) -> Self {
        Self {
            window: QuotaWindow {
                requests_made: 0,
                reset_at: now + config.window,
                max_requests: config.max_requests_per_window,
            },
            config,
        }
    }

    /// Current window
    pub fn window(&self) -> &QuotaWindow {
        &self.window
    }

    /// Configuration in use
    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Count one request if capacity remains, otherwise report when it returns.
    pub fn reserve(&mut self, now: DateTime<Utc>) -> Reservation {
        self.roll_if_expired(now);

        if self.window.is_exhausted() {
            debug!(
                reset_at = %self.window.reset_at,
                requests_made = self.window.requests_made,
                "Quota window exhausted"
            );
            return Reservation::MustWaitUntil(self.window.reset_at);
        }

        self.window.requests_made += 1;
        Reservation::Granted
    }

    /// Treat the window as exhausted after the provider rejected a request.
    ///
    /// The provider is authoritative even when the local count disagrees.
    /// `reset_hint` is the provider's reset time if it sent one; stale hints
    /// are ignored. Returns the instant requests may resume, grace included.
    pub fn mark_exhausted(
        &mut self,
        reset_hint: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let base = match reset_hint.filter(|hint| *hint > now) {
            Some(hint) => hint,
            None if self.window.reset_at > now => self.window.reset_at,
            None => now + self.config.window,
        };
        let resume_at = base + self.config.exhaustion_grace;

        if self.window.remaining() > 0 {
            warn!(
                local_remaining = self.window.remaining(),
                "Provider reported quota exhaustion before the local counter did"
            );
        }

        self.window.requests_made = self.window.max_requests;
        self.window.reset_at = resume_at;
        resume_at
    }

    /// Sync the local window with rate-limit headers from a response.
    pub fn observe(&mut self, quota: &ProviderQuota, now: DateTime<Utc>) {
        let used = self.window.max_requests.saturating_sub(quota.remaining);

        if quota.reset_at > now {
            if quota.reset_at > self.window.reset_at {
                // Provider has moved on to a later window than the one tracked locally.
                self.window.requests_made = used;
            } else {
                self.window.requests_made = self.window.requests_made.max(used);
            }
            self.window.reset_at = quota.reset_at;
        } else {
            self.window.requests_made = self.window.requests_made.max(used);
        }

        debug!(
            provider_remaining = quota.remaining,
            provider_limit = quota.limit,
            local_remaining = self.window.remaining(),
            reset_at = %self.window.reset_at,
            "Quota synced from response headers"
        );
    }

    fn roll_if_expired(&mut self, now: DateTime<Utc>) {
        if now >= self.window.reset_at {
            self.window.requests_made = 0;
            self.window.reset_at = now + self.config.window;
            debug!(reset_at = %self.window.reset_at, "Quota window rolled over");
        }
    }
}
