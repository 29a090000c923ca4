//! PV system identifier parsing and validation
//!
//! PVOutput addresses every installation by a positive integer system id.
//! Ids arrive from the command line as a comma separated list or from a
//! systems CSV with a `system_id` column.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// PVOutput system identifier
///
/// # Examples
///
/// ```
/// use pvoutput_backfill::identifier::SystemId;
///
/// let id = SystemId::parse(" 6112 ").unwrap();
/// assert_eq!(id.get(), 6112);
/// assert_eq!(id.to_string(), "6112");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemId(u64);

impl SystemId {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric id
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Parse an id string. Whitespace is trimmed, zero is rejected.
    pub fn parse(s: &str) -> Result<Self, IdentifierError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::InvalidFormat(
                "system id cannot be empty".to_string(),
            ));
        }

        let id: u64 = trimmed.parse().map_err(|_| {
            IdentifierError::InvalidFormat(format!("'{trimmed}' is not a numeric system id"))
        })?;

        if id == 0 {
            return Err(IdentifierError::InvalidFormat(
                "system id must be positive".to_string(),
            ));
        }

        Ok(Self(id))
    }

    /// Parse a comma separated list, dropping duplicates while keeping first-seen order.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, IdentifierError> {
        let ids = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Err(IdentifierError::InvalidFormat(
                "no system ids given".to_string(),
            ));
        }
        Ok(dedup_preserving_order(ids))
    }

    /// Read ids from a CSV file that has a `system_id` header column.
    ///
    /// Other columns are ignored, so the output of the `search` command can be
    /// fed back in directly.
    pub fn from_systems_csv(path: &Path) -> Result<Vec<Self>, IdentifierError> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| IdentifierError::SystemsFile(format!("{}: {e}", path.display())))?;

        let headers = reader
            .headers()
            .map_err(|e| IdentifierError::SystemsFile(e.to_string()))?
            .clone();
        let column = headers
            .iter()
            .position(|h| h.trim() == "system_id")
            .ok_or_else(|| {
                IdentifierError::SystemsFile(format!(
                    "{} has no 'system_id' column",
                    path.display()
                ))
            })?;

        let mut ids = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| IdentifierError::SystemsFile(e.to_string()))?;
            if let Some(value) = record.get(column) {
                ids.push(Self::parse(value)?);
            }
        }

        if ids.is_empty() {
            return Err(IdentifierError::SystemsFile(format!(
                "{} contains no system ids",
                path.display()
            )));
        }
        Ok(dedup_preserving_order(ids))
    }
}

fn dedup_preserving_order(ids: Vec<SystemId>) -> Vec<SystemId> {
    let mut seen = BTreeSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SystemId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifier errors
#[derive(Debug, thiserror::Error)]
pub enum IdentifierError {
    /// Malformed id
    #[error("invalid system id: {0}")]
    InvalidFormat(String),

    /// Systems CSV could not be read
    #[error("systems file error: {0}")]
    SystemsFile(String),
}
