//! Download jobs and their reports

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::resume::UnitFailure;
use crate::{DateSpan, SystemId};

/// One system and the dates to download for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityJob {
    /// System to download
    pub system_id: SystemId,
    /// Target span, inclusive
    pub span: DateSpan,
}

impl EntityJob {
    /// Create a job
    pub fn new(system_id: SystemId, span: DateSpan) -> Self {
        Self { system_id, span }
    }

    /// Validate job parameters
    pub fn validate(&self) -> Result<(), String> {
        self.span.validate()
    }
}

/// Outcome of one system in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    /// Not started yet
    #[default]
    Pending,
    /// Units still outstanding
    InProgress,
    /// Every date of the span was processed
    Completed,
    /// Aborted by a permanent error
    Failed,
    /// Stopped by the operator
    Cancelled,
}

/// Per-system summary of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    /// System
    pub system_id: SystemId,
    /// Target span
    pub span: DateSpan,
    /// Final status
    pub status: EntityStatus,
    /// Last date of the contiguous completed prefix
    pub cursor: Option<NaiveDate>,
    /// Units committed in this run, failed units included
    pub units: u64,
    /// Provider requests issued, retries and polls included
    pub requests: u64,
    /// Rows written
    pub records: u64,
    /// Dates skipped because the ledger knew them to be empty
    pub skipped_dates: u64,
    /// Dates outside the span the provider's statistic reports data for
    #[serde(default)]
    pub excluded_dates: u64,
    /// Dates newly recorded as empty
    pub missing_recorded: u64,
    /// Units flagged for follow-up
    pub failed_units: Vec<UnitFailure>,
    /// Cause of a permanent failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntityReport {
    /// Empty report for a job
    pub fn new(job: &EntityJob) -> Self {
        Self {
            system_id: job.system_id,
            span: job.span,
            status: EntityStatus::Pending,
            cursor: None,
            units: 0,
            requests: 0,
            records: 0,
            skipped_dates: 0,
            excluded_dates: 0,
            missing_recorded: 0,
            failed_units: Vec::new(),
            error: None,
        }
    }

    /// Dates covered by the cursor
    pub fn completed_dates(&self) -> u32 {
        match self.cursor {
            Some(cursor) if cursor >= self.span.start() => DateSpan::new(self.span.start(), cursor.min(self.span.end()))
                .map(|done| done.days())
                .unwrap_or(0),
            _ => 0,
        }
    }
}

/// Summary of a whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// One report per job, in job order
    pub entities: Vec<EntityReport>,
    /// Times every system waited for the quota window
    pub quota_waits: u64,
}

impl RunReport {
    /// Systems that completed
    pub fn completed(&self) -> usize {
        self.count(EntityStatus::Completed)
    }

    /// Systems aborted by a permanent error
    pub fn failed(&self) -> usize {
        self.count(EntityStatus::Failed)
    }

    /// Systems stopped by cancellation
    pub fn cancelled(&self) -> usize {
        self.count(EntityStatus::Cancelled)
    }

    /// Rows written across systems
    pub fn total_records(&self) -> u64 {
        self.entities.iter().map(|e| e.records).sum()
    }

    /// Requests issued across systems
    pub fn total_requests(&self) -> u64 {
        self.entities.iter().map(|e| e.requests).sum()
    }

    /// Units flagged for follow-up across systems
    pub fn total_failed_units(&self) -> usize {
        self.entities.iter().map(|e| e.failed_units.len()).sum()
    }

    /// Whether every system completed without failed units
    pub fn is_clean(&self) -> bool {
        self.entities
            .iter()
            .all(|e| e.status == EntityStatus::Completed && e.failed_units.is_empty())
    }

    /// Report of one system
    pub fn entity(&self, system_id: SystemId) -> Option<&EntityReport> {
        self.entities.iter().find(|e| e.system_id == system_id)
    }

    fn count(&self, status: EntityStatus) -> usize {
        self.entities.iter().filter(|e| e.status == status).count()
    }
}
