//! Download command implementation

use crate::downloader::{
    DownloadOrchestrator, EntityJob, EntityStatus, Granularity, QuotaConfig, RetryPolicy,
    RunReport, SystemClock,
};
use crate::fetcher::pvoutput_config::QuotaTier;
use crate::fetcher::PvOutputClient;
use crate::resume::{FileStore, ResumeLock, ResumeState};
use crate::shutdown::SharedShutdown;
use crate::{DateSpan, SystemId};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{error, info, warn};

use super::{CliError, CredentialArgs};

/// Default resume state directory
pub const DEFAULT_RESUME_DIR: &str = ".resume";

/// Default output directory
pub const DEFAULT_OUTPUT_DIR: &str = "data";

/// Parse a `YYYY-MM-DD` date argument.
pub fn parse_date(input: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| format!("invalid date '{input}' (expected YYYY-MM-DD): {e}"))
}

/// Parse a share between 0 and 1 (e.g. `0.5`).
pub fn parse_fraction(input: &str) -> Result<f64, String> {
    let value: f64 = input
        .trim()
        .parse()
        .map_err(|e| format!("invalid number '{input}': {e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("'{input}' is not between 0 and 1"))
    }
}

/// Resume modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Continue from saved cursors and ledgers
    On,
    /// Discard saved state of the requested systems and start fresh
    Reset,
    /// Check saved state integrity before starting
    Verify,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" => Ok(ResumeMode::On),
            "reset" => Ok(ResumeMode::Reset),
            "verify" => Ok(ResumeMode::Verify),
            _ => Err(format!(
                "Invalid resume mode: {s}. Valid options: on, reset, verify"
            )),
        }
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// PVOutput backfill CLI
#[derive(Parser, Debug)]
#[command(name = "pvoutput-backfill")]
#[command(about = "Quota-aware, resumable downloader for PVOutput.org system history", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Resume mode: on, reset, or verify
    #[arg(long, global = true, default_value = "on")]
    pub resume: ResumeMode,

    /// Resume state directory (default: ".resume")
    #[arg(long, global = true)]
    pub resume_dir: Option<PathBuf>,

    /// Root directory for downloaded CSV files (default: "data")
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Maximum retries of a unit after transient errors (default: 5, range: 1-20)
    #[arg(long, global = true, default_value = "5", value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_retries: u32,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Resume directory in effect
    pub fn resume_dir(&self) -> PathBuf {
        self.resume_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESUME_DIR))
    }

    /// Output directory in effect
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
    }
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download status history of one or more systems
    Download(DownloadArgs),

    /// Search PVOutput for systems
    Search(super::SearchArgs),

    /// Forget dates recorded as missing so they are requested again
    Purge(super::PurgeArgs),

    /// Validate system ids, saved state or credentials
    Validate(super::ValidateCommand),
}

/// Download command arguments
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    /// Comma separated system ids (e.g. 6112,4232)
    #[arg(long, required_unless_present = "systems_csv")]
    pub systems: Option<String>,

    /// CSV file with a `system_id` column
    #[arg(long, conflicts_with = "systems")]
    pub systems_csv: Option<PathBuf>,

    /// First date to download (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub start_date: NaiveDate,

    /// Last date to download, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub end_date: NaiveDate,

    /// Account tier: free, donated, or batch
    #[arg(long, default_value = "free")]
    pub tier: QuotaTier,

    /// Override the tier's hourly request ceiling
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_requests_per_hour: Option<u32>,

    /// Download each system's metadata before its status history
    #[arg(long, default_value_t = false)]
    pub metadata: bool,

    /// Check each system's statistic first: download only dates it reports
    /// data for, and skip systems with a smaller share of days with output
    /// (0 to 1, e.g. 0.5). Costs one request per system.
    #[arg(long, value_parser = parse_fraction)]
    pub min_data_availability: Option<f64>,

    /// Credentials
    #[command(flatten)]
    pub credentials: CredentialArgs,
}

impl DownloadArgs {
    /// Systems named on the command line or in the systems file
    pub fn system_ids(&self) -> Result<Vec<SystemId>, CliError> {
        match (&self.systems, &self.systems_csv) {
            (Some(list), _) => Ok(SystemId::parse_list(list)?),
            (None, Some(path)) => Ok(SystemId::from_systems_csv(path)?),
            (None, None) => Err(CliError::InvalidArgument(
                "pass --systems or --systems-csv".to_string(),
            )),
        }
    }

    /// Requested span, rejecting reversed and future ranges
    pub fn span(&self) -> Result<DateSpan, CliError> {
        let span = DateSpan::new(self.start_date, self.end_date).map_err(CliError::InvalidArgument)?;
        span.validate_not_future(chrono::Local::now().date_naive())
            .map_err(CliError::InvalidArgument)?;
        Ok(span)
    }

    /// Quota in effect: the tier preset unless overridden
    pub fn quota(&self) -> QuotaConfig {
        match self.max_requests_per_hour {
            Some(max) => QuotaConfig::new(max),
            None => QuotaConfig::for_tier(self.tier),
        }
    }

    /// Execute the download
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let systems = self.system_ids()?;
        let span = self.span()?;
        let quota = self.quota();

        let credentials = self.credentials.credentials()?;
        let client = PvOutputClient::new(credentials)?.with_base_url(&self.credentials.base_url);
        let granularity = if self.tier.uses_batch_endpoint() {
            if !client.has_batch_access() {
                return Err(CliError::ConfigurationError(
                    "the batch tier needs a data service URL: pass --data-service-url or set DATA_SERVICE_URL"
                        .to_string(),
                ));
            }
            Granularity::Batch
        } else {
            Granularity::Daily
        };

        let resume_dir = cli.resume_dir();
        let output_dir = cli.output_dir();
        std::fs::create_dir_all(&output_dir).map_err(|e| {
            CliError::InvalidArgument(format!(
                "Failed to create output directory {}: {e}",
                output_dir.display()
            ))
        })?;
        let _lock = ResumeLock::try_acquire(&resume_dir)?;
        let store = FileStore::new(&output_dir, &resume_dir);

        match cli.resume {
            ResumeMode::Reset => handle_resume_reset(&store, &systems)?,
            ResumeMode::Verify => handle_resume_verify(&store, &systems)?,
            ResumeMode::On => {}
        }

        info!(
            systems = systems.len(),
            span = %span,
            tier = %self.tier,
            max_requests_per_hour = quota.max_requests_per_window,
            output_dir = %output_dir.display(),
            "Starting download"
        );

        let jobs: Vec<EntityJob> = systems
            .iter()
            .map(|id| EntityJob::new(*id, span))
            .collect();

        let mut orchestrator = DownloadOrchestrator::new(client, store, SystemClock, quota)
            .with_granularity(granularity)
            .with_retry_policy(RetryPolicy::with_max_retries(cli.max_retries))
            .with_metadata(self.metadata)
            .with_statistic_filter(self.min_data_availability)
            .with_shutdown(shutdown);

        let progress = (cli.output_format == OutputFormat::Human).then(create_progress_bar);
        if let Some(bar) = &progress {
            orchestrator = orchestrator.with_progress_bar(bar.clone());
        }

        let result = orchestrator.run(jobs).await;
        if let Some(bar) = &progress {
            bar.finish_and_clear();
        }
        let report = result?;

        match cli.output_format {
            OutputFormat::Json => output_json(&report)?,
            OutputFormat::Human => output_human(&report, &output_dir),
        }

        if report.failed() > 0 {
            return Err(CliError::RunFailed(format!(
                "{} of {} systems failed",
                report.failed(),
                report.entities.len()
            )));
        }
        Ok(())
    }
}

/// Handle Reset mode: delete saved state of the requested systems
fn handle_resume_reset(store: &FileStore, systems: &[SystemId]) -> Result<(), CliError> {
    let mut removed = 0;
    for system_id in systems {
        if store.remove_state(*system_id)? {
            removed += 1;
        }
    }
    info!(removed = removed, "Reset mode: discarded saved resume state");
    Ok(())
}

/// Handle Verify mode: check resume state integrity
fn handle_resume_verify(store: &FileStore, systems: &[SystemId]) -> Result<(), CliError> {
    let (valid, invalid) = verify_states(store, systems);
    if invalid > 0 {
        return Err(CliError::InvalidArgument(format!(
            "Verify failed: {invalid} invalid resume state file(s) found. Use --resume reset to clear."
        )));
    }
    info!("Verify passed: {} valid resume state file(s)", valid);
    Ok(())
}

/// Load and check each system's saved state. Returns (valid, invalid) counts.
pub(crate) fn verify_states(store: &FileStore, systems: &[SystemId]) -> (usize, usize) {
    let mut valid = 0;
    let mut invalid = 0;
    for system_id in systems {
        let path = store.state_path(*system_id);
        if !path.exists() {
            continue;
        }
        match ResumeState::load(&path).and_then(|state| state.verify().map(|_| state)) {
            Ok(state) => {
                info!(
                    system_id = %system_id,
                    span = %state.span(),
                    cursor = ?state.cursor(),
                    "Valid resume state"
                );
                valid += 1;
            }
            Err(e) => {
                error!(system_id = %system_id, path = %path.display(), "Invalid resume state: {}", e);
                invalid += 1;
            }
        }
    }
    (valid, invalid)
}

fn output_json(report: &RunReport) -> Result<(), CliError> {
    let json = serde_json::to_string(report)
        .map_err(|e| CliError::InvalidArgument(format!("Failed to serialize report: {e}")))?;
    println!("{json}");
    Ok(())
}

fn output_human(report: &RunReport, output_dir: &Path) {
    println!("\nDownload finished");
    println!("Output: {}", output_dir.display());
    for entity in &report.entities {
        let status = match entity.status {
            EntityStatus::Completed => "completed",
            EntityStatus::Failed => "FAILED",
            EntityStatus::Cancelled => "cancelled",
            EntityStatus::InProgress | EntityStatus::Pending => "incomplete",
        };
        let cursor = entity
            .cursor
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {}: {} rows, {} requests, {} known-missing dates skipped, cursor {}",
            entity.system_id, status, entity.records, entity.requests, entity.skipped_dates, cursor
        );
        for failure in &entity.failed_units {
            warn!(system_id = %entity.system_id, unit = %failure.unit, "Unit needs follow-up: {}", failure.cause);
            println!("    unit {} failed after {} attempts: {}", failure.unit, failure.attempts, failure.cause);
        }
        if entity.excluded_dates > 0 {
            println!("    {} dates outside the system's data excluded", entity.excluded_dates);
        }
        if let Some(err) = &entity.error {
            eprintln!("    error: {err}");
        }
    }
    println!(
        "Systems: {} completed, {} failed, {} cancelled. Quota waits: {}",
        report.completed(),
        report.failed(),
        report.cancelled(),
        report.quota_waits
    );
}

/// Create progress bar with style
fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .expect("hardcoded template is valid")
            .progress_chars("#>-"),
    );
    pb.set_message("Downloading");
    pb
}
