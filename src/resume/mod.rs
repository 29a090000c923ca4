//! Resume capability and the missing-date ledger
//!
//! Provides the ledger of known-empty dates, per-system resume state with
//! atomic writes and file locking, and the store the orchestrator commits to.

pub mod ledger;
pub mod lock;
pub mod state;
pub mod store;

pub use ledger::{MissingRange, MissingRangeLedger};
pub use lock::ResumeLock;
pub use state::{ResumeError, ResumeState, StateMetadata, UnitFailure};
pub use store::{FileStore, ProgressStore};
