//! Per-system range scheduler
//!
//! A [`RangeScheduler`] owns the plan for one system: which unit comes next,
//! and what a classified outcome means for it. It performs no I/O and never
//! sleeps. The orchestrator asks [`RangeScheduler::next_action`] what to do,
//! executes fetches, and feeds each outcome back through
//! [`RangeScheduler::on_outcome`], which answers with a [`Transition`] the
//! orchestrator must persist or wait on.
//!
//! ```text
//! Pending ──plan──▶ Fetching ──Data/Empty──▶ Pending (cursor advanced) ──▶ … ──▶ Done
//!                     │  ▲
//!   TransientError ───┤  ├── backoff elapsed ── Retrying
//!   Accepted ─────────┤  ├── poll interval ──── Polling
//!   RateLimited ──────┘  └── quota reset ────── Blocked
//!   PermanentError ─────────────────────────▶ Failed
//! ```
//!
//! Units are planned in chronological order and the cursor only moves over a
//! unit that ended in `Data` or `Empty`, so the completed dates are always the
//! prefix `[span.start, cursor]`. When a unit exhausts its retries it is
//! recorded as failed and planning continues past it, but the cursor stays
//! pinned in front of it for the rest of the run.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::config::{RetryPolicy, BATCH_WINDOW_DAYS, QUOTA_WINDOW_SECS};
use crate::fetcher::{FetchOutcome, FetchUnit, Payload};
use crate::resume::{MissingRangeLedger, UnitFailure};
use crate::{DateSpan, StatusRecord, SystemId, SystemMetadata, SystemStatistic};

/// How dates are grouped into requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    /// One `getstatus` request per date
    #[default]
    Daily,
    /// One data service request per year of dates
    Batch,
}

/// A unit in flight and what it has cost so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitAttempt {
    /// The unit
    pub unit: FetchUnit,
    /// Transient failures so far
    pub failures: u32,
    /// "Accepted" replies so far
    pub polls: u32,
}

impl UnitAttempt {
    fn new(unit: FetchUnit) -> Self {
        Self {
            unit,
            failures: 0,
            polls: 0,
        }
    }
}

/// Scheduler state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    /// Between units
    Pending,
    /// A request for the unit is due or in flight
    Fetching(UnitAttempt),
    /// Backing off after a transient error
    Retrying {
        /// Unit to retry
        attempt: UnitAttempt,
        /// Earliest retry time
        not_before: DateTime<Utc>,
    },
    /// Waiting for the data service to prepare an accepted request
    Polling {
        /// Unit to poll
        attempt: UnitAttempt,
        /// Earliest poll time
        not_before: DateTime<Utc>,
    },
    /// Waiting for the quota window to reset
    Blocked {
        /// Unit to retry
        attempt: UnitAttempt,
        /// Reset time
        wait_until: DateTime<Utc>,
    },
    /// Span exhausted
    Done,
    /// Aborted by a permanent error
    Failed(String),
}

/// Why a scheduler is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// Retry backoff
    Backoff,
    /// Batch poll interval
    Poll,
    /// Quota reset
    Quota,
}

/// What the orchestrator should do next for a system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// Issue this request
    Fetch(FetchUnit),
    /// Nothing can happen before `until`
    Wait {
        /// Instant the unit becomes due
        until: DateTime<Utc>,
        /// Why
        reason: WaitReason,
    },
    /// All dates handled
    Done,
    /// Aborted
    Failed(String),
}

/// Everything that must be persisted for a finished unit
#[derive(Debug, Clone, PartialEq)]
pub struct UnitCommit {
    /// The unit
    pub unit: FetchUnit,
    /// Rows inside the unit's dates
    pub records: Vec<StatusRecord>,
    /// Metadata, for metadata units
    pub metadata: Option<SystemMetadata>,
    /// Dates confirmed to have no data
    pub missing: Vec<NaiveDate>,
    /// Cursor after the unit
    pub cursor: Option<NaiveDate>,
    /// Set when the unit was abandoned
    pub failure: Option<UnitFailure>,
}

/// Result of feeding an outcome to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The unit is finished; persist it
    Commit(UnitCommit),
    /// Retry the same unit after a backoff
    Retry {
        /// Retry number, 1-based
        attempt: u32,
        /// Earliest retry time
        not_before: DateTime<Utc>,
        /// Error that caused it
        cause: String,
    },
    /// Poll the same unit again
    Poll {
        /// Polls so far
        polls: u32,
        /// Earliest poll time
        not_before: DateTime<Utc>,
    },
    /// Quota exhausted; the unit is not consumed
    Blocked {
        /// Reset time
        until: DateTime<Utc>,
    },
    /// Permanent error; nothing more is scheduled for this system
    Abort {
        /// Error
        cause: String,
    },
    /// No unit was in flight
    Ignored,
}

/// Plans and tracks the download of one system's span
#[derive(Debug, Clone)]
pub struct RangeScheduler {
    system_id: SystemId,
    span: DateSpan,
    granularity: Granularity,
    policy: RetryPolicy,
    cursor: Option<NaiveDate>,
    window: Option<DateSpan>,
    remaining: Option<DateSpan>,
    completed: Option<DateSpan>,
    pinned: bool,
    metadata_pending: bool,
    min_availability: Option<f64>,
    skipped: u64,
    excluded: u64,
    state: SchedulerState,
}

impl RangeScheduler {
    /// Scheduler for a fresh span
    pub fn new(system_id: SystemId, span: DateSpan, granularity: Granularity, policy: RetryPolicy) -> Self {
        Self {
            system_id,
            span,
            granularity,
            policy,
            cursor: None,
            window: Some(span),
            remaining: Some(span),
            completed: None,
            pinned: false,
            metadata_pending: false,
            min_availability: None,
            skipped: 0,
            excluded: 0,
            state: SchedulerState::Pending,
        }
    }

    /// Resume after a stored cursor. Cursors before the span are ignored.
    pub fn with_cursor(mut self, cursor: Option<NaiveDate>) -> Self {
        if let Some(cursor) = cursor.filter(|c| *c >= self.span.start()) {
            let cursor = cursor.min(self.span.end());
            self.cursor = Some(cursor);
            self.remaining = self.span.after(cursor);
        }
        self
    }

    /// Dates inside the span already downloaded by an earlier run that
    /// started later. Planning jumps over them.
    pub fn with_completed(mut self, completed: Option<DateSpan>) -> Self {
        self.completed = completed.and_then(|done| done.intersection(&self.span));
        self
    }

    /// Fetch metadata before the first status unit
    pub fn with_metadata(mut self, fetch_metadata: bool) -> Self {
        self.metadata_pending = fetch_metadata;
        self
    }

    /// Ask for the system's statistic first and plan only the dates it
    /// reports data for. Systems whose share of days with output is below
    /// `min_availability` are skipped entirely.
    pub fn with_statistic_filter(mut self, min_availability: Option<f64>) -> Self {
        self.min_availability = min_availability;
        self
    }

    /// System
    pub fn system_id(&self) -> SystemId {
        self.system_id
    }

    /// Target span
    pub fn span(&self) -> DateSpan {
        self.span
    }

    /// Last date of the contiguous completed prefix
    pub fn cursor(&self) -> Option<NaiveDate> {
        self.cursor
    }

    /// Current state
    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// Dates skipped so far because the ledger knew them to be empty
    pub fn skipped_dates(&self) -> u64 {
        self.skipped
    }

    /// Dates dropped because the statistic reports no data for them
    pub fn excluded_dates(&self) -> u64 {
        self.excluded
    }

    /// Whether a unit failed in this run, freezing the cursor
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Whether the scheduler reached `Done` or `Failed`
    pub fn is_finished(&self) -> bool {
        matches!(self.state, SchedulerState::Done | SchedulerState::Failed(_))
    }

    /// Decide the next step. Plans a new unit when none is in flight,
    /// skipping dates the ledger knows to be empty.
    pub fn next_action(&mut self, ledger: &MissingRangeLedger, now: DateTime<Utc>) -> NextAction {
        match &self.state {
            SchedulerState::Done => return NextAction::Done,
            SchedulerState::Failed(cause) => return NextAction::Failed(cause.clone()),
            SchedulerState::Fetching(attempt) => return NextAction::Fetch(attempt.unit.clone()),
            SchedulerState::Retrying { attempt, not_before }
            | SchedulerState::Polling { attempt, not_before }
            | SchedulerState::Blocked {
                attempt,
                wait_until: not_before,
            } => {
                if now < *not_before {
                    let reason = match self.state {
                        SchedulerState::Retrying { .. } => WaitReason::Backoff,
                        SchedulerState::Polling { .. } => WaitReason::Poll,
                        _ => WaitReason::Quota,
                    };
                    return NextAction::Wait {
                        until: *not_before,
                        reason,
                    };
                }
                let attempt = attempt.clone();
                let unit = attempt.unit.clone();
                self.state = SchedulerState::Fetching(attempt);
                return NextAction::Fetch(unit);
            }
            SchedulerState::Pending => {}
        }

        match self.plan(ledger) {
            Some(unit) => {
                self.state = SchedulerState::Fetching(UnitAttempt::new(unit.clone()));
                NextAction::Fetch(unit)
            }
            None => {
                debug!(system_id = %self.system_id, cursor = ?self.cursor, "Span exhausted");
                self.state = SchedulerState::Done;
                NextAction::Done
            }
        }
    }

    fn plan(&mut self, ledger: &MissingRangeLedger) -> Option<FetchUnit> {
        if self.min_availability.is_some() && self.remaining.is_some() {
            return Some(FetchUnit::Statistic {
                system_id: self.system_id,
            });
        }
        if self.metadata_pending {
            return Some(FetchUnit::Metadata {
                system_id: self.system_id,
            });
        }

        let mut remaining = self.remaining?;
        loop {
            let date = remaining.start();
            if let Some(done) = self.completed.filter(|done| done.contains(date)) {
                if !self.pinned {
                    self.cursor = Some(done.end());
                }
                debug!(system_id = %self.system_id, dates = %done, "Skipping dates downloaded earlier");
                self.completed = None;
                self.remaining = remaining.after(done.end());
            } else if ledger.is_known_missing(self.system_id, date) {
                self.skipped += 1;
                if !self.pinned {
                    self.cursor = Some(date);
                }
                debug!(system_id = %self.system_id, date = %date, "Skipping known-missing date");
                self.remaining = remaining.after(date);
            } else {
                break;
            }
            remaining = self.remaining?;
        }

        // Batch units stop short of a block downloaded earlier
        if let Some(done) = self.completed.filter(|done| done.start() > remaining.start()) {
            let before = done.start().pred_opt().unwrap_or(done.start());
            remaining = DateSpan::new(remaining.start(), before.min(remaining.end())).unwrap_or(remaining);
        }

        Some(match self.granularity {
            Granularity::Daily => FetchUnit::TimeSeries {
                system_id: self.system_id,
                date: remaining.start(),
            },
            Granularity::Batch => FetchUnit::BatchStatus {
                system_id: self.system_id,
                span: remaining.head(BATCH_WINDOW_DAYS),
            },
        })
    }

    /// Restrict planning to the dates a statistic reports data for.
    fn narrow(&mut self, statistic: Option<&SystemStatistic>) {
        let min_availability = self.min_availability.take().unwrap_or(0.0);
        let Some(remaining) = self.remaining else {
            return;
        };

        let data_span = statistic.and_then(SystemStatistic::data_span);
        let availability = statistic.and_then(SystemStatistic::data_availability);
        let kept = match data_span {
            None => {
                info!(system_id = %self.system_id, "Statistic reports no data, skipping system");
                None
            }
            Some(_) if availability.is_some_and(|a| a < min_availability) => {
                info!(
                    system_id = %self.system_id,
                    availability_pct = availability.map(|a| (a * 100.0).round()),
                    min_pct = (min_availability * 100.0).round(),
                    "Data availability too low, skipping system"
                );
                None
            }
            Some(data) => remaining.intersection(&data),
        };

        let kept_days = kept.map_or(0, |span| span.days());
        self.excluded += u64::from(remaining.days() - kept_days);
        self.window = self.window.and_then(|w| match kept {
            Some(kept) => DateSpan::new(w.start(), kept.end()).ok(),
            None => None,
        });
        self.remaining = kept;
        debug!(system_id = %self.system_id, remaining = ?self.remaining, excluded = self.excluded, "Span narrowed by statistic");
    }

    /// Apply the classified outcome of the unit in flight.
    ///
    /// For `RateLimited` the caller passes the instant the governor allows
    /// requests again; without one the scheduler waits a full quota window.
    pub fn on_outcome(&mut self, outcome: FetchOutcome, now: DateTime<Utc>) -> Transition {
        let attempt = match std::mem::replace(&mut self.state, SchedulerState::Pending) {
            SchedulerState::Fetching(attempt) => attempt,
            other => {
                warn!(system_id = %self.system_id, state = ?other, "Outcome received with no unit in flight");
                self.state = other;
                return Transition::Ignored;
            }
        };

        match outcome {
            FetchOutcome::Data(payload) => self.on_data(attempt, payload, now),
            FetchOutcome::Empty => {
                let missing = match &attempt.unit {
                    FetchUnit::Statistic { .. } => {
                        self.narrow(None);
                        Vec::new()
                    }
                    FetchUnit::Metadata { .. } => {
                        warn!(system_id = %self.system_id, "Provider returned no metadata");
                        Vec::new()
                    }
                    unit => unit.span().map(|span| span.dates().collect()).unwrap_or_default(),
                };
                Transition::Commit(self.complete(attempt.unit, Vec::new(), None, missing))
            }
            FetchOutcome::RateLimited { reset_at } => {
                let until = reset_at
                    .filter(|at| *at > now)
                    .unwrap_or(now + Duration::seconds(QUOTA_WINDOW_SECS));
                self.state = SchedulerState::Blocked {
                    attempt,
                    wait_until: until,
                };
                Transition::Blocked { until }
            }
            FetchOutcome::Accepted => {
                let mut attempt = attempt;
                attempt.polls += 1;
                if attempt.polls > self.policy.max_polls {
                    let cause = format!("data not ready after {} polls", self.policy.max_polls);
                    return Transition::Commit(self.fail_unit(attempt, cause, now));
                }
                let not_before = now + to_chrono(self.policy.poll_interval);
                let polls = attempt.polls;
                self.state = SchedulerState::Polling { attempt, not_before };
                Transition::Poll { polls, not_before }
            }
            FetchOutcome::TransientError(cause) => self.on_transient(attempt, cause, now),
            FetchOutcome::PermanentError(cause) => {
                warn!(
                    system_id = %self.system_id,
                    unit = %attempt.unit,
                    cause = %cause,
                    "Permanent error, abandoning remaining span"
                );
                self.state = SchedulerState::Failed(cause.clone());
                Transition::Abort { cause }
            }
        }
    }

    fn on_data(&mut self, attempt: UnitAttempt, payload: Payload, now: DateTime<Utc>) -> Transition {
        match (&attempt.unit, payload) {
            (FetchUnit::Metadata { .. }, Payload::Metadata(metadata)) => {
                Transition::Commit(self.complete(attempt.unit, Vec::new(), Some(metadata), Vec::new()))
            }
            (FetchUnit::Statistic { .. }, Payload::Statistic(statistic)) => {
                self.narrow(Some(&statistic));
                Transition::Commit(self.complete(attempt.unit, Vec::new(), None, Vec::new()))
            }
            (FetchUnit::TimeSeries { .. } | FetchUnit::BatchStatus { .. }, Payload::Status(rows)) => {
                let Some(span) = attempt.unit.span() else {
                    return self.on_transient(attempt, "unit without dates".to_string(), now);
                };
                let records: Vec<StatusRecord> =
                    rows.into_iter().filter(|r| span.contains(r.date())).collect();
                let with_rows: BTreeSet<NaiveDate> = records.iter().map(StatusRecord::date).collect();
                let missing = span.dates().filter(|d| !with_rows.contains(d)).collect();
                Transition::Commit(self.complete(attempt.unit, records, None, missing))
            }
            _ => self.on_transient(attempt, "response payload does not match request kind".to_string(), now),
        }
    }

    fn on_transient(&mut self, mut attempt: UnitAttempt, cause: String, now: DateTime<Utc>) -> Transition {
        attempt.failures += 1;
        if attempt.failures > self.policy.max_retries {
            return Transition::Commit(self.fail_unit(attempt, cause, now));
        }

        let retry = attempt.failures;
        let not_before = now + to_chrono(self.policy.backoff(retry));
        self.state = SchedulerState::Retrying { attempt, not_before };
        Transition::Retry {
            attempt: retry,
            not_before,
            cause,
        }
    }

    /// Finish a unit with `Data` or `Empty`: the cursor moves over it.
    fn complete(
        &mut self,
        unit: FetchUnit,
        records: Vec<StatusRecord>,
        metadata: Option<SystemMetadata>,
        missing: Vec<NaiveDate>,
    ) -> UnitCommit {
        match unit.span() {
            Some(span) => {
                if !self.pinned {
                    self.cursor = Some(span.end());
                }
                self.remaining = self.window.and_then(|w| w.after(span.end()));
            }
            None => self.settle_prelude(&unit),
        }

        UnitCommit {
            unit,
            records,
            metadata,
            missing,
            cursor: self.cursor,
            failure: None,
        }
    }

    fn settle_prelude(&mut self, unit: &FetchUnit) {
        match unit {
            FetchUnit::Metadata { .. } => self.metadata_pending = false,
            // An unusable statistic leaves the span as it is
            FetchUnit::Statistic { .. } => self.min_availability = None,
            _ => {}
        }
    }

    /// Abandon a unit: planning moves past it, the cursor does not.
    fn fail_unit(&mut self, attempt: UnitAttempt, cause: String, now: DateTime<Utc>) -> UnitCommit {
        match attempt.unit.span() {
            Some(span) => {
                self.pinned = true;
                self.remaining = self.window.and_then(|w| w.after(span.end()));
            }
            None => self.settle_prelude(&attempt.unit),
        }

        warn!(
            system_id = %self.system_id,
            unit = %attempt.unit,
            failures = attempt.failures,
            polls = attempt.polls,
            cause = %cause,
            "Unit failed, continuing past it"
        );

        UnitCommit {
            unit: attempt.unit.clone(),
            records: Vec::new(),
            metadata: None,
            missing: Vec::new(),
            cursor: self.cursor,
            failure: Some(UnitFailure {
                unit: attempt.unit,
                cause,
                attempts: attempt.failures + attempt.polls,
                failed_at: now,
            }),
        }
    }
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::seconds(QUOTA_WINDOW_SECS))
}
