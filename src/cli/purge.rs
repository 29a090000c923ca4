//! Purge command: forget dates recorded as missing
//!
//! A date lands in the ledger when the provider had nothing for it. Owners
//! sometimes upload history late; purging a span makes the next download
//! request those dates again.

use super::{Cli, CliError, OutputFormat};
use crate::cli::download::parse_date;
use crate::resume::{FileStore, MissingRangeLedger, ResumeLock, ResumeState};
use crate::{DateSpan, SystemId};
use chrono::{NaiveDate, Utc};
use clap::Args;
use serde::Serialize;
use tracing::info;

/// Purge arguments
#[derive(Debug, Args)]
pub struct PurgeArgs {
    /// Comma separated system ids
    #[arg(long)]
    pub systems: String,

    /// First date to purge (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub start_date: NaiveDate,

    /// Last date to purge, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date)]
    pub end_date: NaiveDate,
}

/// Dates removed from one system's ledger
#[derive(Debug, Clone, Serialize)]
pub struct PurgeOutcome {
    /// System
    pub system_id: SystemId,
    /// Dates forgotten
    pub removed: usize,
}

impl PurgeArgs {
    /// Execute the purge
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let systems = SystemId::parse_list(&self.systems)?;
        let span = DateSpan::new(self.start_date, self.end_date).map_err(CliError::InvalidArgument)?;

        let resume_dir = cli.resume_dir();
        let _lock = ResumeLock::try_acquire(&resume_dir)?;
        let store = FileStore::new(cli.output_dir(), &resume_dir);

        let outcomes = systems
            .iter()
            .map(|id| purge_system(&store, *id, span))
            .collect::<Result<Vec<_>, _>>()?;

        match cli.output_format {
            OutputFormat::Json => {
                let json = serde_json::to_string(&outcomes).map_err(|e| {
                    CliError::InvalidArgument(format!("Failed to serialize results: {e}"))
                })?;
                println!("{json}");
            }
            OutputFormat::Human => {
                for outcome in &outcomes {
                    println!(
                        "System {}: {} dates in {span} will be requested again",
                        outcome.system_id, outcome.removed
                    );
                }
            }
        }
        Ok(())
    }
}

/// Remove a span from one system's saved ledger.
pub fn purge_system(store: &FileStore, system_id: SystemId, span: DateSpan) -> Result<PurgeOutcome, CliError> {
    let path = store.state_path(system_id);
    if !path.exists() {
        return Ok(PurgeOutcome {
            system_id,
            removed: 0,
        });
    }

    let mut state = ResumeState::load(&path)?;
    let mut ledger = MissingRangeLedger::new();
    ledger.extend_from_ranges(system_id, state.missing_ranges());
    let removed = ledger.purge(system_id, span);

    if removed > 0 {
        state.set_missing_ranges(ledger.ranges(system_id));
        // Purged dates behind the cursor would never be requested again.
        if state.cursor().is_some_and(|cursor| cursor >= span.start()) {
            let rewound = span
                .start()
                .pred_opt()
                .filter(|date| *date >= state.span().start());
            state.set_cursor(rewound);
        }
        state.touch(Utc::now());
        state.save(&path)?;
        info!(system_id = %system_id, span = %span, removed = removed, "Purged missing dates");
    }
    Ok(PurgeOutcome { system_id, removed })
}
