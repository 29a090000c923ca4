//! Missing-date ledger
//!
//! Records (system, date) pairs the provider confirmed have no data, so the
//! scheduler can skip them without spending quota. Entries are only ever
//! added or purged; an existing entry is never rewritten.
//!
//! On disk the ledger is stored per system as merged [`MissingRange`]s inside
//! the resume state. The first-observed timestamp is advisory: merging keeps
//! the earliest one and it never affects whether a date is skipped.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{DateSpan, SystemId};

/// Consecutive missing dates of one system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRange {
    /// First missing date
    pub start: NaiveDate,
    /// Last missing date (inclusive)
    pub end: NaiveDate,
    /// Earliest time any date in the range was observed missing
    pub first_observed: DateTime<Utc>,
}

impl MissingRange {
    /// Dates covered by the range
    pub fn span(&self) -> Option<DateSpan> {
        DateSpan::new(self.start, self.end).ok()
    }
}

/// In-memory ledger of dates known to have no data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingRangeLedger {
    entries: BTreeMap<SystemId, BTreeMap<NaiveDate, DateTime<Utc>>>,
}

impl MissingRangeLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the date is recorded as missing for the system
    pub fn is_known_missing(&self, system_id: SystemId, date: NaiveDate) -> bool {
        self.entries
            .get(&system_id)
            .is_some_and(|dates| dates.contains_key(&date))
    }

    /// Record a missing date. Returns `false` if it was already recorded,
    /// in which case the original observation time is kept.
    pub fn record_missing(
        &mut self,
        system_id: SystemId,
        date: NaiveDate,
        observed_at: DateTime<Utc>,
    ) -> bool {
        let dates = self.entries.entry(system_id).or_default();
        if dates.contains_key(&date) {
            return false;
        }
        dates.insert(date, observed_at);
        true
    }

    /// Remove every recorded date of the system inside `span`.
    /// Returns how many were removed.
    pub fn purge(&mut self, system_id: SystemId, span: DateSpan) -> usize {
        let Some(dates) = self.entries.get_mut(&system_id) else {
            return 0;
        };

        let doomed: Vec<NaiveDate> = dates
            .range(span.start()..=span.end())
            .map(|(date, _)| *date)
            .collect();
        for date in &doomed {
            dates.remove(date);
        }
        if dates.is_empty() {
            self.entries.remove(&system_id);
        }
        doomed.len()
    }

    /// Number of recorded dates of the system inside `span`
    pub fn count_in(&self, system_id: SystemId, span: DateSpan) -> usize {
        self.entries
            .get(&system_id)
            .map(|dates| dates.range(span.start()..=span.end()).count())
            .unwrap_or(0)
    }

    /// Number of recorded dates of the system
    pub fn len(&self, system_id: SystemId) -> usize {
        self.entries.get(&system_id).map(BTreeMap::len).unwrap_or(0)
    }

    /// Whether nothing is recorded for any system
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Systems with at least one recorded date
    pub fn systems(&self) -> impl Iterator<Item = SystemId> + '_ {
        self.entries.keys().copied()
    }

    /// Recorded dates of the system merged into consecutive ranges
    pub fn ranges(&self, system_id: SystemId) -> Vec<MissingRange> {
        let mut ranges: Vec<MissingRange> = Vec::new();
        let Some(dates) = self.entries.get(&system_id) else {
            return ranges;
        };

        for (&date, &observed) in dates {
            match ranges.last_mut() {
                Some(last) if last.end + Duration::days(1) == date => {
                    last.end = date;
                    last.first_observed = last.first_observed.min(observed);
                }
                _ => ranges.push(MissingRange {
                    start: date,
                    end: date,
                    first_observed: observed,
                }),
            }
        }
        ranges
    }

    /// Load persisted ranges for a system. Dates already present keep
    /// their observation time.
    pub fn extend_from_ranges(&mut self, system_id: SystemId, ranges: &[MissingRange]) {
        for range in ranges {
            if let Some(span) = range.span() {
                for date in span.dates() {
                    self.record_missing(system_id, date, range.first_observed);
                }
            }
        }
    }
}
