//! Download orchestrator
//!
//! Drives every system's [`RangeScheduler`] in round-robin turns, one unit
//! per system per turn and one request in flight at a time. Each request is
//! gated by the [`QuotaGovernor`]; when it refuses, all work is suspended
//! until the window reopens because the quota belongs to the API key, not to
//! a system.
//!
//! Every finished unit is committed in a fixed order: rows, then ledger,
//! then resume state. The cursor is therefore never durable ahead of the
//! data it covers.

use chrono::{DateTime, NaiveDate, Utc};
use indicatif::ProgressBar;
use std::collections::HashSet;
use tracing::{debug, info, info_span, warn, Instrument};

use super::clock::Clock;
use super::config::RetryPolicy;
use super::job::{EntityJob, EntityReport, EntityStatus, RunReport};
use super::progress::{ProgressState, ProgressTracker};
use super::quota::{QuotaConfig, QuotaGovernor, Reservation};
use super::scheduler::{Granularity, NextAction, RangeScheduler, Transition, UnitCommit};
use super::DownloadError;
use crate::fetcher::retry_formatter::RetryContext;
use crate::fetcher::{FetchOutcome, FetchUnit, ProviderClient};
use crate::metrics::{self, SystemMetrics};
use crate::resume::{MissingRangeLedger, ProgressStore, ResumeState};
use crate::shutdown::{self, SharedShutdown};

/// Runtime bookkeeping of one system
struct EntityRun {
    job: EntityJob,
    scheduler: RangeScheduler,
    state: ResumeState,
    report: EntityReport,
    metrics: SystemMetrics,
    saved_cursor: Option<NaiveDate>,
    prior_dates: u64,
    skipped_seen: u64,
    excluded_seen: u64,
    finished: bool,
}

/// Coordinates scheduler, client, governor and store across systems
pub struct DownloadOrchestrator<C, S, K>
where
    C: ProviderClient,
    S: ProgressStore,
    K: Clock,
{
    client: C,
    store: S,
    clock: K,
    quota: QuotaConfig,
    granularity: Granularity,
    policy: RetryPolicy,
    fetch_metadata: bool,
    min_availability: Option<f64>,
    progress_tracker: ProgressTracker,
    progress_bar: Option<ProgressBar>,
    shutdown: Option<SharedShutdown>,
}

impl<C, S, K> DownloadOrchestrator<C, S, K>
where
    C: ProviderClient,
    S: ProgressStore,
    K: Clock,
{
    /// Create an orchestrator with daily granularity and default retries
    pub fn new(client: C, store: S, clock: K, quota: QuotaConfig) -> Self {
        Self {
            client,
            store,
            clock,
            quota,
            granularity: Granularity::Daily,
            policy: RetryPolicy::default(),
            fetch_metadata: false,
            min_availability: None,
            progress_tracker: ProgressTracker::default(),
            progress_bar: None,
            shutdown: shutdown::get_global_shutdown(),
        }
    }

    /// Choose one request per date or per batch window
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Override retry and polling limits
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fetch each system's metadata before its status history
    pub fn with_metadata(mut self, fetch_metadata: bool) -> Self {
        self.fetch_metadata = fetch_metadata;
        self
    }

    /// Ask each system's statistic first, download only the dates it
    /// reports data for, and skip systems with a smaller share of days
    /// with output than `min_availability` (0 to 1).
    pub fn with_statistic_filter(mut self, min_availability: Option<f64>) -> Self {
        self.min_availability = min_availability;
        self
    }

    /// Attach a shared shutdown handle for graceful cancellation.
    pub fn with_shutdown(mut self, shutdown: SharedShutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Override progress log cadence.
    pub fn with_progress_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.progress_tracker = tracker;
        self
    }

    /// Drive a progress bar measured in dates
    pub fn with_progress_bar(mut self, bar: ProgressBar) -> Self {
        self.progress_bar = Some(bar);
        self
    }

    /// The store, for inspection after a run
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The client
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Download every job until its span is exhausted, it fails
    /// permanently, or shutdown is requested.
    ///
    /// Returns `Err` only for invalid jobs or storage failures.
    pub async fn run(&mut self, jobs: Vec<EntityJob>) -> Result<RunReport, DownloadError> {
        self.quota.validate().map_err(DownloadError::ValidationError)?;
        if let Some(min) = self.min_availability.filter(|m| !(0.0..=1.0).contains(m)) {
            return Err(DownloadError::ValidationError(format!(
                "minimum data availability must be between 0 and 1, got {min}"
            )));
        }
        for job in &jobs {
            job.validate().map_err(DownloadError::ValidationError)?;
        }
        let mut seen = HashSet::new();
        if let Some(dup) = jobs.iter().find(|job| !seen.insert(job.system_id)) {
            return Err(DownloadError::ValidationError(format!(
                "system {} appears more than once",
                dup.system_id
            )));
        }

        let mut ledger = MissingRangeLedger::new();
        let mut runs = Vec::with_capacity(jobs.len());
        for job in jobs {
            runs.push(self.prepare(job, &mut ledger)?);
        }

        let total_dates: u64 = runs.iter().map(|r| u64::from(r.job.span.days())).sum();
        let mut progress = self.progress_tracker.create_state(total_dates);
        progress.add_dates(
            runs.iter()
                .map(|r| u64::from(r.report.completed_dates()) + r.prior_dates)
                .sum(),
        );
        if let Some(bar) = &self.progress_bar {
            bar.set_length(total_dates);
            bar.set_position(progress.dates_done);
        }

        info!(
            systems = runs.len(),
            total_dates = total_dates,
            max_requests_per_window = self.quota.max_requests_per_window,
            granularity = ?self.granularity,
            "Starting download run"
        );

        let mut governor = QuotaGovernor::new(self.quota, self.clock.now());
        let mut quota_waits = 0u64;
        let mut cancelled = false;

        'run: loop {
            let mut progressed = false;
            let mut earliest_wait: Option<DateTime<Utc>> = None;

            for run in runs.iter_mut().filter(|r| !r.finished) {
                if self.shutdown_requested() {
                    cancelled = true;
                    break 'run;
                }

                let action = run.scheduler.next_action(&ledger, self.clock.now());
                account_skips(run, &mut progress);

                match action {
                    NextAction::Done => {
                        self.finish(run, &ledger)?;
                        progressed = true;
                    }
                    NextAction::Failed(cause) => {
                        self.fail(run, cause, &ledger)?;
                        progressed = true;
                    }
                    NextAction::Wait { until, reason } => {
                        debug!(system_id = %run.job.system_id, until = %until, reason = ?reason, "Unit not yet due");
                        earliest_wait = Some(earliest_wait.map_or(until, |w| w.min(until)));
                    }
                    NextAction::Fetch(unit) => {
                        if !self.acquire_quota(&mut governor, &mut quota_waits).await {
                            cancelled = true;
                            break 'run;
                        }

                        let outcome = self.execute(&unit, &mut governor).await;
                        run.report.requests += 1;
                        progress.add_request();

                        let transition = run.scheduler.on_outcome(outcome, self.clock.now());
                        self.apply_transition(run, &unit, transition, &mut ledger, &mut progress)?;
                        progressed = true;
                    }
                }
            }

            if runs.iter().all(|r| r.finished) {
                break;
            }

            if !progressed {
                if let Some(until) = earliest_wait {
                    if !self.sleep_until(until).await {
                        cancelled = true;
                        break;
                    }
                }
            }
        }

        if cancelled {
            info!("Shutdown requested - saving progress before exiting");
            for run in runs.iter_mut().filter(|r| !r.finished) {
                run.report.status = EntityStatus::Cancelled;
                self.persist(run, &ledger)?;
                run.finished = true;
            }
        }

        if let Some(bar) = &self.progress_bar {
            bar.set_position(progress.dates_done);
            bar.finish_with_message(if cancelled { "cancelled" } else { "done" });
        }

        let report = RunReport {
            entities: runs
                .into_iter()
                .map(|mut run| {
                    run.report.cursor = run.scheduler.cursor();
                    run.report
                })
                .collect(),
            quota_waits,
        };

        info!(
            completed = report.completed(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            records = report.total_records(),
            requests = report.total_requests(),
            failed_units = report.total_failed_units(),
            "Download run finished"
        );
        Ok(report)
    }

    /// Load stored state for a job and build its scheduler.
    fn prepare(&mut self, job: EntityJob, ledger: &mut MissingRangeLedger) -> Result<EntityRun, DownloadError> {
        let system_id = job.system_id;
        let (state, cursor, completed) = match self.store.load_state(system_id)? {
            Some(state) => {
                ledger.extend_from_ranges(system_id, state.missing_ranges());
                // The cursor claims a prefix from the stored start. It carries
                // over when that prefix covers the new start; a prefix starting
                // later is a block to jump over instead.
                let (cursor, completed) = if state.span().start() <= job.span.start() {
                    (state.cursor(), None)
                } else {
                    (None, state.completed())
                };
                info!(
                    system_id = %system_id,
                    stored_span = %state.span(),
                    cursor = ?cursor,
                    completed = ?completed,
                    known_missing = ledger.len(system_id),
                    "Resuming from saved state"
                );
                (state, cursor, completed)
            }
            None => (ResumeState::new(system_id, job.span, self.clock.now()), None, None),
        };

        let scheduler = RangeScheduler::new(system_id, job.span, self.granularity, self.policy)
            .with_cursor(cursor)
            .with_completed(completed)
            .with_metadata(self.fetch_metadata && !state.metadata_fetched())
            .with_statistic_filter(self.min_availability);
        let prior_dates = completed
            .and_then(|done| done.intersection(&job.span))
            .map_or(0, |done| u64::from(done.days()));

        let mut report = EntityReport::new(&job);
        report.cursor = scheduler.cursor();
        report.status = EntityStatus::InProgress;

        Ok(EntityRun {
            saved_cursor: scheduler.cursor(),
            prior_dates,
            job,
            scheduler,
            state,
            report,
            metrics: SystemMetrics::start(system_id),
            skipped_seen: 0,
            excluded_seen: 0,
            finished: false,
        })
    }

    /// Reserve one request, waiting out exhausted windows.
    /// Returns `false` if shutdown interrupted the wait.
    async fn acquire_quota(&self, governor: &mut QuotaGovernor, quota_waits: &mut u64) -> bool {
        loop {
            let now = self.clock.now();
            match governor.reserve(now) {
                Reservation::Granted => return true,
                Reservation::MustWaitUntil(until) => {
                    let wait = (until - now).to_std().unwrap_or_default();
                    info!(
                        resume_at = %until,
                        wait_secs = wait.as_secs(),
                        "Request quota exhausted, suspending all systems"
                    );
                    metrics::record_quota_wait(wait);
                    *quota_waits += 1;
                    if !self.sleep_until(until).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Issue one request and fold its quota information into the governor.
    async fn execute(&self, unit: &FetchUnit, governor: &mut QuotaGovernor) -> FetchOutcome {
        let span = info_span!("unit", system_id = %unit.system_id(), unit = %unit);
        let response = self.client.fetch(unit).instrument(span).await;
        let now = self.clock.now();

        let outcome = match response.outcome {
            FetchOutcome::RateLimited { reset_at } => {
                let resume_at = governor.mark_exhausted(reset_at, now);
                FetchOutcome::RateLimited {
                    reset_at: Some(resume_at),
                }
            }
            other => {
                if let Some(quota) = &response.quota {
                    governor.observe(quota, now);
                }
                other
            }
        };

        metrics::record_quota_remaining(governor.window().remaining());
        debug!(unit = %unit, outcome = outcome.label(), "Unit outcome");
        outcome
    }

    fn apply_transition(
        &mut self,
        run: &mut EntityRun,
        unit: &FetchUnit,
        transition: Transition,
        ledger: &mut MissingRangeLedger,
        progress: &mut ProgressState,
    ) -> Result<(), DownloadError> {
        match transition {
            Transition::Commit(commit) => self.commit(run, commit, ledger, progress)?,
            Transition::Retry {
                attempt,
                not_before,
                cause,
            } => {
                let backoff = (not_before - self.clock.now()).to_std().unwrap_or_default();
                let context = RetryContext::new(attempt, self.policy.max_retries, backoff, unit, cause);
                warn!(system_id = %run.job.system_id, "{}", context.format_retry());
                metrics::record_retry_backoff(unit.kind(), backoff, attempt);
            }
            Transition::Poll { polls, not_before } => {
                info!(
                    system_id = %run.job.system_id,
                    unit = %unit,
                    polls = polls,
                    next_poll = %not_before,
                    "Batch request accepted, data not ready yet"
                );
            }
            Transition::Blocked { until } => {
                warn!(
                    system_id = %run.job.system_id,
                    unit = %unit,
                    resume_at = %until,
                    "Provider rejected request: quota exhausted"
                );
            }
            Transition::Abort { cause } => self.fail(run, cause, ledger)?,
            Transition::Ignored => {}
        }
        Ok(())
    }

    /// Persist a finished unit: rows, then ledger, then resume state.
    fn commit(
        &mut self,
        run: &mut EntityRun,
        commit: UnitCommit,
        ledger: &mut MissingRangeLedger,
        progress: &mut ProgressState,
    ) -> Result<(), DownloadError> {
        let system_id = run.job.system_id;
        let now = self.clock.now();
        let unit_span = commit.unit.span();

        if let Some(span) = unit_span {
            self.store.write_records(system_id, span, &commit.records)?;
        }
        if let Some(metadata) = &commit.metadata {
            self.store.write_metadata(metadata)?;
        }
        if commit.failure.is_none() && matches!(commit.unit, FetchUnit::Metadata { .. }) {
            run.state.set_metadata_fetched();
        }

        let mut recorded = 0u64;
        for date in &commit.missing {
            if ledger.record_missing(system_id, *date, now) {
                recorded += 1;
            }
        }
        metrics::record_ledger_additions(recorded);

        match commit.failure {
            Some(failure) => {
                let context = RetryContext::new(
                    failure.attempts,
                    self.policy.max_retries,
                    std::time::Duration::ZERO,
                    &failure.unit,
                    failure.cause.clone(),
                );
                warn!(system_id = %system_id, "{}", context.format_failure());
                metrics::record_unit_failure(failure.unit.kind());
                run.state.record_failure(failure.clone());
                run.report.failed_units.push(failure);
            }
            None => {
                if run.state.clear_failure(&commit.unit) {
                    info!(system_id = %system_id, unit = %commit.unit, "Previously failed unit recovered");
                }
            }
        }

        let records = commit.records.len() as u64;
        run.state.record_unit(records, now);
        run.report.units += 1;
        run.report.records += records;
        run.report.missing_recorded += recorded;
        run.report.cursor = commit.cursor;

        self.persist(run, ledger)?;

        if let Some(span) = unit_span {
            progress.add_dates(u64::from(span.days()));
        }
        progress.set_phase(Some(format!("system {system_id}, {}", commit.unit)));
        self.report_progress(progress);

        debug!(
            system_id = %system_id,
            unit = %commit.unit,
            records = records,
            missing = recorded,
            cursor = ?commit.cursor,
            "Unit committed"
        );
        Ok(())
    }

    /// Write the system's resume state with the scheduler's progress merged
    /// in and the ledger.
    fn persist(&mut self, run: &mut EntityRun, ledger: &MissingRangeLedger) -> Result<(), DownloadError> {
        let system_id = run.job.system_id;
        run.state.merge_progress(run.job.span, run.scheduler.cursor());
        run.state.set_missing_ranges(ledger.ranges(system_id));
        self.store.save_state(&run.state)?;
        run.saved_cursor = run.scheduler.cursor();
        Ok(())
    }

    fn finish(&mut self, run: &mut EntityRun, ledger: &MissingRangeLedger) -> Result<(), DownloadError> {
        if run.scheduler.cursor() != run.saved_cursor {
            self.persist(run, ledger)?;
        }
        run.report.status = EntityStatus::Completed;
        run.finished = true;
        run.metrics
            .record_success(run.report.records, run.report.failed_units.len());
        Ok(())
    }

    fn fail(&mut self, run: &mut EntityRun, cause: String, ledger: &MissingRangeLedger) -> Result<(), DownloadError> {
        if run.scheduler.cursor() != run.saved_cursor {
            self.persist(run, ledger)?;
        }
        run.metrics.record_failure(&cause);
        run.report.status = EntityStatus::Failed;
        run.report.error = Some(cause);
        run.finished = true;
        Ok(())
    }

    fn report_progress(&self, progress: &mut ProgressState) {
        if let Some(bar) = &self.progress_bar {
            bar.set_position(progress.dates_done);
            if let Some(phase) = &progress.current_phase {
                bar.set_message(phase.clone());
            }
        }
        if progress.should_emit_update() {
            info!("{}", progress.format_progress());
            progress.mark_emitted();
        }
    }

    /// Sleep until `deadline` unless shutdown is requested first.
    /// Returns `false` when interrupted.
    async fn sleep_until(&self, deadline: DateTime<Utc>) -> bool {
        if self.shutdown_requested() {
            return false;
        }
        match &self.shutdown {
            Some(shutdown) => {
                tokio::select! {
                    _ = self.clock.sleep_until(deadline) => true,
                    _ = shutdown.wait_for_shutdown() => false,
                }
            }
            None => {
                self.clock.sleep_until(deadline).await;
                true
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }
}

/// Fold dates the scheduler skipped through the ledger or dropped after the
/// statistic into report and progress.
fn account_skips(run: &mut EntityRun, progress: &mut ProgressState) {
    let excluded = run.scheduler.excluded_dates();
    if excluded > run.excluded_seen {
        let delta = excluded - run.excluded_seen;
        run.excluded_seen = excluded;
        run.report.excluded_dates += delta;
        progress.add_dates(delta);
        debug!(system_id = %run.job.system_id, excluded = delta, "Dates without data excluded");
    }

    let skipped = run.scheduler.skipped_dates();
    let delta = skipped - run.skipped_seen;
    if delta > 0 {
        run.skipped_seen = skipped;
        run.report.skipped_dates += delta;
        progress.add_dates(delta);
        metrics::record_ledger_skips(delta);
        debug!(system_id = %run.job.system_id, skipped = delta, "Known-missing dates skipped");
    }
}
