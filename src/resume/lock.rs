//! Advisory lock on the resume directory
//!
//! Two runs sharing one resume directory would interleave cursor and ledger
//! writes for the same systems. The lock is held for the life of the
//! [`ResumeLock`] and released when it is dropped.

use super::state::ResumeError;
use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the run lock file inside the resume directory
pub const RUN_LOCK_FILE: &str = "run.lock";

/// Exclusive lock over a resume directory
pub struct ResumeLock {
    // Keeps the descriptor, and with it the OS lock, alive.
    _lock: RwLock<File>,
    path: PathBuf,
}

impl ResumeLock {
    /// Acquire the lock, blocking until it is available.
    pub fn acquire(resume_dir: &Path) -> Result<Self, ResumeError> {
        Self::lock(resume_dir, true)
    }

    /// Acquire the lock without blocking.
    ///
    /// Returns an error immediately if another process holds it.
    pub fn try_acquire(resume_dir: &Path) -> Result<Self, ResumeError> {
        Self::lock(resume_dir, false)
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(resume_dir: &Path, block: bool) -> Result<Self, ResumeError> {
        std::fs::create_dir_all(resume_dir).map_err(|e| ResumeError::IoError(e.to_string()))?;

        let path = resume_dir.join(RUN_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ResumeError::LockError(format!("Failed to open lock file: {e}")))?;

        let mut lock = RwLock::new(file);
        {
            let guard = if block {
                lock.write()
            } else {
                lock.try_write()
            }
            .map_err(|e| {
                ResumeError::LockError(format!(
                    "resume directory {} is locked by another run: {e}",
                    resume_dir.display()
                ))
            })?;
            // Dropping the guard would unlock; the OS releases the lock when the file closes.
            std::mem::forget(guard);
        }

        debug!(path = %path.display(), "Resume directory locked");
        Ok(Self { _lock: lock, path })
    }
}
