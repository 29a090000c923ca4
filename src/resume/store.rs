//! Durable progress store
//!
//! The orchestrator commits each unit through a [`ProgressStore`]: rows
//! first, then the resume state carrying the cursor and ledger. If the
//! process dies between the two writes the cursor is still behind the unit,
//! so the next run fetches it again and overwrites the same unit file.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::state::{ResumeError, ResumeState};
use crate::downloader::DownloadError;
use crate::fetcher::pvoutput_parser::format_date;
use crate::output::csv::{write_metadata_file, write_status_file};
use crate::{DateSpan, StatusRecord, SystemId, SystemMetadata};

/// Where fetched rows and resume state are persisted.
pub trait ProgressStore: Send {
    /// Resume state of a system, if any was saved
    fn load_state(&mut self, system_id: SystemId) -> Result<Option<ResumeState>, DownloadError>;

    /// Persist the rows of one unit. Writing the same span again replaces it.
    fn write_records(
        &mut self,
        system_id: SystemId,
        span: DateSpan,
        records: &[StatusRecord],
    ) -> Result<(), DownloadError>;

    /// Persist system metadata
    fn write_metadata(&mut self, metadata: &SystemMetadata) -> Result<(), DownloadError>;

    /// Persist resume state
    fn save_state(&mut self, state: &ResumeState) -> Result<(), DownloadError>;
}

/// File-backed store: CSV rows under `output_dir`, JSON state under `resume_dir`.
///
/// Layout:
/// - `{output_dir}/{system_id}/{start}_{end}.csv` per unit with rows
/// - `{output_dir}/{system_id}/metadata.csv`
/// - `{resume_dir}/{system_id}.json`
#[derive(Debug, Clone)]
pub struct FileStore {
    output_dir: PathBuf,
    resume_dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at the given directories
    pub fn new(output_dir: impl Into<PathBuf>, resume_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            resume_dir: resume_dir.into(),
        }
    }

    /// Output directory
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Resume directory
    pub fn resume_dir(&self) -> &Path {
        &self.resume_dir
    }

    /// Path of a system's resume state
    pub fn state_path(&self, system_id: SystemId) -> PathBuf {
        self.resume_dir.join(format!("{system_id}.json"))
    }

    /// Path of the CSV file for one unit
    pub fn unit_path(&self, system_id: SystemId, span: DateSpan) -> PathBuf {
        self.output_dir.join(system_id.to_string()).join(format!(
            "{}_{}.csv",
            format_date(span.start()),
            format_date(span.end())
        ))
    }

    /// Path of a system's metadata file
    pub fn metadata_path(&self, system_id: SystemId) -> PathBuf {
        self.output_dir.join(system_id.to_string()).join("metadata.csv")
    }

    /// Delete a system's resume state. Returns whether a file existed.
    pub fn remove_state(&self, system_id: SystemId) -> Result<bool, ResumeError> {
        let path = self.state_path(system_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                let _ = std::fs::remove_file(path.with_extension("lock"));
                info!(system_id = %system_id, path = %path.display(), "Resume state removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ResumeError::IoError(e.to_string())),
        }
    }

    /// Systems with a saved resume state
    pub fn saved_systems(&self) -> Result<Vec<SystemId>, ResumeError> {
        let entries = match std::fs::read_dir(&self.resume_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ResumeError::IoError(e.to_string())),
        };

        let mut systems = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| ResumeError::IoError(e.to_string()))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| SystemId::parse(stem).ok())
            {
                systems.push(id);
            }
        }
        systems.sort();
        Ok(systems)
    }
}

impl ProgressStore for FileStore {
    fn load_state(&mut self, system_id: SystemId) -> Result<Option<ResumeState>, DownloadError> {
        let path = self.state_path(system_id);
        if !path.exists() {
            debug!(system_id = %system_id, "No resume state found");
            return Ok(None);
        }
        Ok(Some(ResumeState::load(&path)?))
    }

    fn write_records(
        &mut self,
        system_id: SystemId,
        span: DateSpan,
        records: &[StatusRecord],
    ) -> Result<(), DownloadError> {
        if records.is_empty() {
            return Ok(());
        }
        let path = self.unit_path(system_id, span);
        let written = write_status_file(&path, records)?;
        debug!(system_id = %system_id, span = %span, rows = written, "Unit rows written");
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &SystemMetadata) -> Result<(), DownloadError> {
        write_metadata_file(&self.metadata_path(metadata.system_id), metadata)?;
        Ok(())
    }

    fn save_state(&mut self, state: &ResumeState) -> Result<(), DownloadError> {
        state.save(&self.state_path(state.system_id()))?;
        Ok(())
    }
}
