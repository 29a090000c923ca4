//! Download orchestration and quota management
//!
//! # Overview
//!
//! The downloader turns a list of systems and date spans into a sequence of
//! provider requests that never exceeds the hourly quota:
//!
//! 1. **Jobs**: one [`EntityJob`] per system and span
//! 2. **Planning**: a [`RangeScheduler`] per system picks the next unit and
//!    skips dates the missing-date ledger already knows to be empty
//! 3. **Quota**: the [`QuotaGovernor`] grants each request or names the
//!    instant the window reopens
//! 4. **Execution**: the [`DownloadOrchestrator`] interleaves systems
//!    round-robin, one request at a time, and commits every finished unit
//!    through a [`ProgressStore`](crate::resume::ProgressStore)
//!
//! # Quick Start
//!
//! ```no_run
//! use pvoutput_backfill::downloader::{DownloadOrchestrator, EntityJob, QuotaConfig, SystemClock};
//! use pvoutput_backfill::fetcher::pvoutput_config::Credentials;
//! use pvoutput_backfill::fetcher::PvOutputClient;
//! use pvoutput_backfill::resume::FileStore;
//! use pvoutput_backfill::SystemId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PvOutputClient::new(Credentials::new("key", "1234", None)?)?;
//! let store = FileStore::new("./data", "./.resume");
//! let job = EntityJob::new(SystemId::new(6112), "2020-01-01..2020-12-31".parse()?);
//!
//! let mut orchestrator = DownloadOrchestrator::new(client, store, SystemClock, QuotaConfig::new(60));
//! let report = orchestrator.run(vec![job]).await?;
//! assert_eq!(report.failed(), 0);
//! # Ok(())
//! # }
//! ```
//!
//! # Components
//!
//! - [`executor`] - The orchestrating loop
//! - [`scheduler`] - Per-system state machine
//! - [`quota`] - Request quota accounting
//! - [`job`] - Jobs and run reports
//! - [`config`] - Backoff, polling and quota constants
//! - [`clock`] - Time source, replaceable in tests
//! - [`progress`] - Periodic progress lines
//!
//! # Error Handling
//!
//! Provider failures never surface as [`DownloadError`]: they are retried,
//! recorded as failed units, or mark a single system as failed in the
//! [`RunReport`]. `DownloadError` is reserved for invalid jobs and for
//! storage failures, after which nothing can be committed safely.

pub mod clock;
pub mod config;
pub mod executor;
pub mod job;
pub mod progress;
pub mod quota;
pub mod scheduler;

pub use clock::{Clock, SystemClock};
pub use config::RetryPolicy;
pub use executor::DownloadOrchestrator;
pub use job::{EntityJob, EntityReport, EntityStatus, RunReport};
pub use quota::{QuotaConfig, QuotaGovernor, QuotaWindow, Reservation};
pub use scheduler::{
    Granularity, NextAction, RangeScheduler, SchedulerState, Transition, UnitCommit, WaitReason,
};

use crate::output::OutputError;
use crate::resume::ResumeError;

/// Download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Resume state could not be read or written
    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),

    /// Rows could not be written
    #[error("output error: {0}")]
    OutputError(#[from] OutputError),

    /// Validation error
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Storage backend error
    #[error("storage error: {0}")]
    StorageError(String),
}
