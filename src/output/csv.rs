//! CSV output writers
//!
//! Rows go to a temporary file next to the target and are renamed into place
//! on [`OutputWriter::close`], so a crash mid-write never leaves a partial
//! unit file behind. Re-writing a unit replaces the previous file.

use crate::{StatusRecord, SystemMetadata};
use chrono::NaiveDateTime;
use csv::Writer;
use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{MetadataWriter, OutputError, OutputResult, OutputWriter, StatusWriter};

const DEFAULT_BUFFER_SIZE: usize = 8192; // 8KB buffer

/// CSV file staged in a temporary file until closed
struct StagedCsv {
    writer: Writer<BufWriter<NamedTempFile>>,
    target: PathBuf,
}

impl StagedCsv {
    fn create(path: &Path, buffer_size: usize) -> OutputResult<Self> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)
            .map_err(|e| OutputError::IoError(format!("Failed to create directory: {e}")))?;

        let temp = NamedTempFile::new_in(parent)
            .map_err(|e| OutputError::IoError(format!("Failed to create temp file: {e}")))?;

        Ok(Self {
            writer: Writer::from_writer(BufWriter::with_capacity(buffer_size, temp)),
            target: path.to_path_buf(),
        })
    }

    fn flush(&mut self) -> OutputResult<()> {
        self.writer
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {e}")))
    }

    fn persist(self) -> OutputResult<()> {
        let mut buf_writer = self
            .writer
            .into_inner()
            .map_err(|e| OutputError::IoError(format!("Failed to get inner writer: {e}")))?;
        buf_writer
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {e}")))?;
        let temp = buf_writer
            .into_inner()
            .map_err(|e| OutputError::IoError(format!("Failed to get temp file: {e}")))?;

        temp.as_file()
            .sync_all()
            .map_err(|e| OutputError::IoError(format!("Failed to sync file: {e}")))?;
        temp.persist(&self.target)
            .map_err(|e| OutputError::IoError(format!("Failed to persist file: {e}")))?;
        Ok(())
    }
}

/// CSV writer for status readings of one fetch unit
pub struct CsvStatusWriter {
    file: StagedCsv,
    seen: HashSet<NaiveDateTime>,
    records_written: u64,
    duplicates_skipped: u64,
}

impl CsvStatusWriter {
    /// Create a writer that will produce `path` on close
    pub fn new<P: AsRef<Path>>(path: P) -> OutputResult<Self> {
        Self::new_with_buffer_size(path, DEFAULT_BUFFER_SIZE)
    }

    /// Create a writer with a custom buffer size
    pub fn new_with_buffer_size<P: AsRef<Path>>(
        path: P,
        buffer_size: usize,
    ) -> OutputResult<Self> {
        let path = path.as_ref();
        debug!("Creating CSV status writer: path={}", path.display());
        Ok(Self {
            file: StagedCsv::create(path, buffer_size)?,
            seen: HashSet::new(),
            records_written: 0,
            duplicates_skipped: 0,
        })
    }

    /// Number of readings written so far
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Readings dropped because their timestamp was already written
    pub fn duplicates_skipped(&self) -> u64 {
        self.duplicates_skipped
    }
}

impl StatusWriter for CsvStatusWriter {
    fn write_status(&mut self, record: &StatusRecord) -> OutputResult<()> {
        // PVOutput occasionally repeats a reading at the same timestamp
        if !self.seen.insert(record.datetime) {
            self.duplicates_skipped += 1;
            return Ok(());
        }

        self.file
            .writer
            .serialize(record)
            .map_err(|e| OutputError::CsvError(format!("Failed to write status: {e}")))?;
        self.records_written += 1;
        Ok(())
    }
}

impl OutputWriter for CsvStatusWriter {
    fn flush(&mut self) -> OutputResult<()> {
        self.file.flush()
    }

    fn close(self) -> OutputResult<()> {
        info!(
            path = %self.file.target.display(),
            records = self.records_written,
            duplicates = self.duplicates_skipped,
            "Closing CSV status writer"
        );
        self.file.persist()
    }
}

/// CSV writer for system metadata
pub struct CsvMetadataWriter {
    file: StagedCsv,
    rows_written: u64,
}

impl CsvMetadataWriter {
    /// Create a writer that will produce `path` on close
    pub fn new<P: AsRef<Path>>(path: P) -> OutputResult<Self> {
        Ok(Self {
            file: StagedCsv::create(path.as_ref(), DEFAULT_BUFFER_SIZE)?,
            rows_written: 0,
        })
    }

    /// Number of rows written so far
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

impl MetadataWriter for CsvMetadataWriter {
    fn write_metadata(&mut self, metadata: &SystemMetadata) -> OutputResult<()> {
        self.file
            .writer
            .serialize(metadata)
            .map_err(|e| OutputError::CsvError(format!("Failed to write metadata: {e}")))?;
        self.rows_written += 1;
        Ok(())
    }
}

impl OutputWriter for CsvMetadataWriter {
    fn flush(&mut self) -> OutputResult<()> {
        self.file.flush()
    }

    fn close(self) -> OutputResult<()> {
        debug!(path = %self.file.target.display(), "Closing CSV metadata writer");
        self.file.persist()
    }
}

/// Write a complete status file in one call. Returns the rows written.
pub fn write_status_file(path: &Path, records: &[StatusRecord]) -> OutputResult<u64> {
    let mut writer = CsvStatusWriter::new(path)?;
    writer.write_statuses(records)?;
    let written = writer.records_written();
    writer.close()?;
    Ok(written)
}

/// Write a single-row metadata file.
pub fn write_metadata_file(path: &Path, metadata: &SystemMetadata) -> OutputResult<()> {
    let mut writer = CsvMetadataWriter::new(path)?;
    writer.write_metadata(metadata)?;
    writer.close()
}
