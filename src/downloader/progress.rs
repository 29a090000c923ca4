//! Periodic progress reporting for long backfills.
//!
//! A backfill on a free account covers about 60 dates an hour, so a run can
//! last days. [`ProgressState`] counts processed dates across all systems and
//! decides when a `[PROGRESS]` log line is due: on every 10% step, or once a
//! minute after the first half minute.

use std::time::{Duration, Instant};

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
const MIN_DOWNLOAD_DURATION: Duration = Duration::from_secs(30);

/// Lightweight builder that controls update cadence.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    update_interval: Duration,
    min_percentage_step: f64,
}

impl ProgressTracker {
    /// Create a tracker with custom interval and percentage step.
    pub fn new(update_interval: Duration, min_percentage_step: f64) -> Self {
        Self {
            update_interval,
            min_percentage_step,
        }
    }

    /// Build a [`ProgressState`] for `total_dates` dates.
    pub fn create_state(&self, total_dates: u64) -> ProgressState {
        let mut state = ProgressState::new(total_dates);
        state.update_interval = self.update_interval;
        state.min_percentage_step = self.min_percentage_step;
        state
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_INTERVAL, 10.0)
    }
}

/// Progress of one run.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Dates handled so far: fetched, skipped, or given up on.
    pub dates_done: u64,
    /// Dates targeted by the run.
    pub total_dates: u64,
    /// Provider requests issued.
    pub requests: u64,
    /// Timestamp when the run started.
    pub start_time: Instant,
    /// Last time progress was reported.
    pub last_update: Instant,
    /// Minimum interval between progress updates.
    pub update_interval: Duration,
    /// Current phase (e.g. "system 6112, 2019-03-04").
    pub current_phase: Option<String>,
    /// Last reported completion percentage (0-100).
    pub last_reported_percentage: f64,
    /// Minimum percentage delta required to emit a new update.
    pub min_percentage_step: f64,
}

impl ProgressState {
    /// Create a new progress state with default intervals.
    pub fn new(total_dates: u64) -> Self {
        let now = Instant::now();
        Self {
            dates_done: 0,
            total_dates,
            requests: 0,
            start_time: now,
            last_update: now,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            current_phase: None,
            last_reported_percentage: 0.0,
            min_percentage_step: 10.0,
        }
    }

    /// Count handled dates.
    pub fn add_dates(&mut self, dates: u64) {
        self.dates_done = self.dates_done.saturating_add(dates).min(self.total_dates);
    }

    /// Count one provider request.
    pub fn add_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    /// Whether a progress update should be emitted based on time or percentage.
    pub fn should_emit_update(&self) -> bool {
        if self.dates_done == 0 {
            return false;
        }

        if self.percentage() - self.last_reported_percentage >= self.min_percentage_step {
            return true;
        }

        self.start_time.elapsed() >= MIN_DOWNLOAD_DURATION
            && self.last_update.elapsed() >= self.update_interval
    }

    /// Call after emitting a progress log to reset timers and cached percentage.
    pub fn mark_emitted(&mut self) {
        self.last_update = Instant::now();
        self.last_reported_percentage = self.percentage();
    }

    /// Set descriptive phase label.
    pub fn set_phase<S: Into<String>>(&mut self, phase: Option<S>) {
        self.current_phase = phase.map(|s| s.into());
    }

    /// Completion percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_dates == 0 {
            return 100.0;
        }
        (self.dates_done as f64 / self.total_dates as f64) * 100.0
    }

    /// Estimate remaining time from the date rate so far. Quota waits are
    /// part of the elapsed time, so the estimate already accounts for them.
    pub fn estimate_remaining(&self) -> Option<Duration> {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if self.dates_done == 0 || elapsed <= 0.0 {
            return None;
        }
        let remaining = self.total_dates.saturating_sub(self.dates_done);
        if remaining == 0 {
            return None;
        }
        let rate = self.dates_done as f64 / elapsed;
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self) -> String {
        let mut parts = vec![format!(
            "[PROGRESS] Processed {}/{} dates - {:.1}% complete",
            self.dates_done,
            self.total_dates,
            self.percentage()
        )];

        if let Some(phase) = &self.current_phase {
            parts.push(format!("({phase})"));
        }

        parts.push(format!("after {} requests", self.requests));

        if let Some(remaining) = self.estimate_remaining() {
            parts.push(format!("- ~{} remaining", format_duration(remaining)));
        }

        parts.join(" ")
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
