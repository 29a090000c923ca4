//! Data output writers

use crate::{StatusRecord, SystemMetadata};

pub mod csv;

/// Output writer errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// Buffer flush error
    #[error("flush error: {0}")]
    FlushError(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Generic output writer trait
pub trait OutputWriter {
    /// Flush any buffered data
    fn flush(&mut self) -> OutputResult<()>;

    /// Finalize output. Nothing is visible at the target path before this returns.
    fn close(self) -> OutputResult<()>;
}

/// Trait for writing status readings
pub trait StatusWriter: OutputWriter {
    /// Write a single reading
    fn write_status(&mut self, record: &StatusRecord) -> OutputResult<()>;

    /// Write multiple readings at once
    fn write_statuses(&mut self, records: &[StatusRecord]) -> OutputResult<()> {
        for record in records {
            self.write_status(record)?;
        }
        Ok(())
    }
}

/// Trait for writing system metadata
pub trait MetadataWriter: OutputWriter {
    /// Write one system's metadata row
    fn write_metadata(&mut self, metadata: &SystemMetadata) -> OutputResult<()>;
}
