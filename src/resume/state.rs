//! Per-system resume state
//!
//! One JSON file per system holds its progress cursor, its slice of the
//! missing-date ledger and the units that failed after exhausting retries.
//! Writes are atomic (temp file, fsync, rename) and guarded by an advisory
//! lock on a sibling `.lock` file.

use chrono::{DateTime, NaiveDate, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

use super::ledger::MissingRange;
use crate::fetcher::FetchUnit;
use crate::{DateSpan, SystemId};

/// Current resume state schema version
const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum allowed state file size (10 MB) to prevent memory exhaustion
pub const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// A fetch unit abandoned after exhausting its retry or poll budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    /// The unit that failed
    pub unit: FetchUnit,
    /// Last cause reported
    pub cause: String,
    /// Attempts made, polls included
    pub attempts: u32,
    /// When the unit was given up on
    pub failed_at: DateTime<Utc>,
}

/// Resume state of one system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    schema_version: String,
    system_id: SystemId,
    span: DateSpan,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<NaiveDate>,
    #[serde(default)]
    missing: Vec<MissingRange>,
    #[serde(default)]
    failed_units: Vec<UnitFailure>,
    #[serde(default)]
    metadata_fetched: bool,
    metadata: StateMetadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ResumeState {
    /// Fresh state for a system and target span
    pub fn new(system_id: SystemId, span: DateSpan, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            system_id,
            span,
            cursor: None,
            missing: Vec::new(),
            failed_units: Vec::new(),
            metadata_fetched: false,
            metadata: StateMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// System this state belongs to
    pub fn system_id(&self) -> SystemId {
        self.system_id
    }

    /// Target span of the run that last wrote this state
    pub fn span(&self) -> DateSpan {
        self.span
    }

    /// Last date of the contiguous completed prefix
    pub fn cursor(&self) -> Option<NaiveDate> {
        self.cursor
    }

    /// Move the cursor. Only the orchestrator calls this.
    pub fn set_cursor(&mut self, cursor: Option<NaiveDate>) {
        self.cursor = cursor;
    }

    /// Persisted ledger ranges
    pub fn missing_ranges(&self) -> &[MissingRange] {
        &self.missing
    }

    /// Replace persisted ledger ranges
    pub fn set_missing_ranges(&mut self, ranges: Vec<MissingRange>) {
        self.missing = ranges;
    }

    /// Units flagged for follow-up
    pub fn failed_units(&self) -> &[UnitFailure] {
        &self.failed_units
    }

    /// Flag a failed unit, replacing an earlier failure of the same unit
    pub fn record_failure(&mut self, failure: UnitFailure) {
        self.failed_units.retain(|f| f.unit != failure.unit);
        self.failed_units.push(failure);
        self.metadata.total_failures += 1;
    }

    /// Drop failures a successful unit makes obsolete: the same unit, or
    /// any unit of the same system whose dates it covers.
    pub fn clear_failure(&mut self, unit: &FetchUnit) -> bool {
        let before = self.failed_units.len();
        self.failed_units.retain(|f| !supersedes(unit, &f.unit));
        before != self.failed_units.len()
    }

    /// Completed prefix `[span.start, cursor]`, if any
    pub fn completed(&self) -> Option<DateSpan> {
        DateSpan::new(self.span.start(), self.cursor?).ok()
    }

    /// Fold a run's progress over `span` into the stored progress.
    ///
    /// When the run's completed prefix and the stored one touch, the span
    /// becomes their union and the cursor the later of the two, so a
    /// narrower run never moves the cursor back. Disjoint progress replaces
    /// the stored one only if the run has some and will not reach the
    /// stored prefix by itself.
    pub fn merge_progress(&mut self, span: DateSpan, cursor: Option<NaiveDate>) {
        let cursor = cursor.filter(|c| span.contains(*c));
        let stored = (self.span, self.cursor.filter(|c| self.span.contains(*c)));
        let run = (span, cursor);
        let (first, second) = if stored.0.start() <= run.0.start() {
            (stored, run)
        } else {
            (run, stored)
        };

        // First date the earlier prefix does not cover
        let first_gap = match first.1 {
            Some(c) => c.succ_opt().unwrap_or(c),
            None => first.0.start(),
        };

        if second.0.start() <= first_gap {
            let start = first.0.start();
            let end = first.0.end().max(second.0.end());
            self.span = DateSpan::new(start, end).unwrap_or(span);
            self.cursor = first.1.max(second.1);
            return;
        }

        let stored_ahead = self
            .completed()
            .is_some_and(|done| span.start() < done.start() && done.end() <= span.end());
        if cursor.is_some() && !stored_ahead {
            debug!(
                system_id = %self.system_id,
                stored_span = %self.span,
                span = %span,
                "Replacing disjoint stored progress"
            );
            self.span = span;
            self.cursor = cursor;
        }
    }

    /// Whether metadata has been written for this system
    pub fn metadata_fetched(&self) -> bool {
        self.metadata_fetched
    }

    /// Mark metadata as written
    pub fn set_metadata_fetched(&mut self) {
        self.metadata_fetched = true;
    }

    /// Counters
    pub fn metadata(&self) -> &StateMetadata {
        &self.metadata
    }

    /// Count a committed unit
    pub fn record_unit(&mut self, records: u64, now: DateTime<Utc>) {
        self.metadata.total_units += 1;
        self.metadata.total_records += records;
        self.updated_at = now;
    }

    /// Mark the state as updated without counting a unit
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of last update
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Validate schema version (accepts current version only)
    pub fn validate_schema_version(&self) -> Result<(), ResumeError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ResumeError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: self.schema_version.clone(),
            });
        }
        Ok(())
    }

    /// Check internal consistency: the cursor lies inside the span and
    /// ledger ranges are ordered and well formed.
    pub fn verify(&self) -> Result<(), ResumeError> {
        self.validate_schema_version()?;

        if let Some(cursor) = self.cursor {
            if cursor < self.span.start() || cursor > self.span.end() {
                return Err(ResumeError::Inconsistent(format!(
                    "cursor {cursor} outside span {}",
                    self.span
                )));
            }
        }

        let mut previous: Option<NaiveDate> = None;
        for range in &self.missing {
            if range.start > range.end {
                return Err(ResumeError::Inconsistent(format!(
                    "missing range {}..{} is reversed",
                    range.start, range.end
                )));
            }
            if previous.is_some_and(|end| range.start <= end) {
                return Err(ResumeError::Inconsistent(format!(
                    "missing range starting {} overlaps its predecessor",
                    range.start
                )));
            }
            previous = Some(range.end);
        }
        Ok(())
    }

    /// Save state to file with atomic writes and file locking
    pub fn save(&self, path: &Path) -> Result<(), ResumeError> {
        debug!(
            path = %path.display(),
            system_id = %self.system_id,
            cursor = ?self.cursor,
            "Saving resume state"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ResumeError::IoError(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ResumeError::SerializationError(e.to_string()))?;

        let lock_path = path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| ResumeError::LockError(format!("Failed to create lock file: {e}")))?;

        let mut lock = RwLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|e| ResumeError::LockError(format!("Failed to acquire write lock: {e}")))?;

        let parent_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| ResumeError::IoError(format!("Failed to create temp file: {e}")))?;

        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| ResumeError::IoError(format!("Failed to write to temp file: {e}")))?;

        // Flush and sync before the rename so the new content is durable
        temp_file
            .flush()
            .map_err(|e| ResumeError::IoError(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| ResumeError::IoError(format!("Failed to sync temp file: {e}")))?;

        temp_file
            .persist(path)
            .map_err(|e| ResumeError::IoError(format!("Failed to persist temp file: {e}")))?;

        // Fsync parent directory so the rename itself is durable
        if let Ok(dir) = std::fs::File::open(parent_dir) {
            let _ = dir.sync_all();
        }

        debug!(
            path = %path.display(),
            missing_ranges = self.missing.len(),
            failed_units = self.failed_units.len(),
            "Resume state saved"
        );
        Ok(())
    }

    /// Load state from file with locking
    pub fn load(path: &Path) -> Result<Self, ResumeError> {
        debug!(path = %path.display(), "Loading resume state");

        let lock_path = path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| ResumeError::LockError(format!("Failed to create lock file: {e}")))?;

        let lock = RwLock::new(lock_file);
        let _guard = lock
            .read()
            .map_err(|e| ResumeError::LockError(format!("Failed to acquire read lock: {e}")))?;

        let metadata = std::fs::metadata(path).map_err(|e| ResumeError::IoError(e.to_string()))?;
        if metadata.len() > MAX_STATE_FILE_SIZE {
            return Err(ResumeError::StateTooLarge {
                size: metadata.len(),
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| ResumeError::IoError(e.to_string()))?;

        let state: ResumeState = serde_json::from_str(&contents).map_err(|e| {
            warn!(error = %e, "Failed to deserialize resume state");
            ResumeError::DeserializationError(e.to_string())
        })?;

        if let Err(e) = state.validate_schema_version() {
            warn!(
                found_version = %state.schema_version,
                expected_version = SCHEMA_VERSION,
                "Resume state schema version mismatch"
            );
            return Err(e);
        }

        info!(
            system_id = %state.system_id,
            cursor = ?state.cursor,
            missing_ranges = state.missing.len(),
            failed_units = state.failed_units.len(),
            "Resume state loaded"
        );
        Ok(state)
    }
}

/// Whether a successful `done` unit makes an earlier failure of `failed` obsolete
fn supersedes(done: &FetchUnit, failed: &FetchUnit) -> bool {
    if done == failed {
        return true;
    }
    if done.system_id() != failed.system_id() {
        return false;
    }
    match (done.span(), failed.span()) {
        (Some(done), Some(failed)) => done.start() <= failed.start() && failed.end() <= done.end(),
        _ => false,
    }
}

/// Counters kept alongside the resume state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StateMetadata {
    total_units: u64,
    total_records: u64,
    total_failures: u64,
}

impl StateMetadata {
    /// Units committed over all runs
    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    /// Rows written over all runs
    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Unit failures over all runs
    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }
}

/// Errors related to resume state
#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// State file too large
    #[error("state file too large: {size} bytes (max: {max} bytes)")]
    StateTooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// State content contradicts itself
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Lock error
    #[error("lock error: {0}")]
    LockError(String),
}
