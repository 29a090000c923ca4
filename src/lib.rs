//! # PVOutput Backfill Library
//!
//! A quota-aware, resumable batch downloader for historical photovoltaic data
//! published on [PVOutput.org](https://pvoutput.org).
//!
//! PVOutput allows 60 requests per hour on a free account and 300 on a donated
//! one, so a multi-year backfill across many systems spends most of its life
//! waiting for the quota window to roll over. This crate is built around that
//! constraint.
//!
//! ## Features
//!
//! - **Quota Governor**: local accounting of the hourly request window, synced from
//!   the provider's `X-Rate-Limit-*` headers
//! - **Missing-Date Ledger**: dates confirmed empty are never requested again
//! - **Exact Resume**: per-system progress cursor persisted atomically after every unit
//! - **Batch Access**: uses the data service `getbatchstatus` endpoint (a year per request)
//!   when a paid data service URL is configured
//! - **Fair Scheduling**: systems are interleaved round-robin, one request at a time
//!
//! ## Quick Start
//!
//! ```no_run
//! use pvoutput_backfill::downloader::{DownloadOrchestrator, EntityJob, QuotaConfig, SystemClock};
//! use pvoutput_backfill::fetcher::pvoutput_config::{Credentials, QuotaTier};
//! use pvoutput_backfill::fetcher::pvoutput_http::PvOutputClient;
//! use pvoutput_backfill::resume::FileStore;
//! use pvoutput_backfill::{DateSpan, SystemId};
//! use chrono::NaiveDate;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials::new("api-key", "12345", None)?;
//! let client = PvOutputClient::new(credentials)?;
//! let store = FileStore::new("./data", "./.resume");
//!
//! let span = DateSpan::new(
//!     NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(),
//!     NaiveDate::from_ymd_opt(2019, 1, 31).unwrap(),
//! )?;
//! let jobs = vec![EntityJob::new(SystemId::new(6112), span)];
//!
//! let mut orchestrator = DownloadOrchestrator::new(
//!     client,
//!     store,
//!     SystemClock,
//!     QuotaConfig::for_tier(QuotaTier::Free),
//! );
//! let report = orchestrator.run(jobs).await?;
//! println!("{} systems completed", report.completed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`downloader`] - Quota governor, range scheduler and the orchestrating loop
//! - [`fetcher`] - PVOutput HTTP client, response classification and parsing
//! - [`resume`] - Missing-date ledger, resume state and the durable progress store
//! - [`output`] - CSV writers for status rows and system metadata
//! - [`cli`] - Command line interface
//!
//! Dates are treated as opaque local-calendar values of the PV system. PVOutput
//! does not say which time zone a system reports in, so nothing here converts them.

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CLI command implementations
pub mod cli;

/// Download orchestration
pub mod downloader;

/// Provider client and response handling
pub mod fetcher;

/// PV system identifiers
pub mod identifier;

/// Observability metrics
pub mod metrics;

/// Data output writers
pub mod output;

/// Resume capability and the missing-date ledger
pub mod resume;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

pub use identifier::SystemId;

/// Inclusive range of calendar dates in the PV system's local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateSpan {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateSpan {
    /// Create a span, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        let span = Self { start, end };
        span.validate()?;
        Ok(span)
    }

    /// Span covering a single date.
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// First date of the span
    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Last date of the span (inclusive)
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Validate span ordering
    pub fn validate(&self) -> Result<(), String> {
        if self.start > self.end {
            return Err(format!(
                "start date {} must not be after end date {}",
                self.start, self.end
            ));
        }
        Ok(())
    }

    /// Reject spans reaching past `today`. PVOutput refuses future dates.
    pub fn validate_not_future(&self, today: NaiveDate) -> Result<(), String> {
        if self.end > today {
            return Err(format!(
                "end date {} is in the future (today is {today})",
                self.end
            ));
        }
        Ok(())
    }

    /// Number of days covered (always at least 1).
    pub fn days(&self) -> u32 {
        ((self.end - self.start).num_days() + 1) as u32
    }

    /// Whether `date` falls inside the span
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Iterate all dates in ascending order.
    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    /// Overlap of two spans, if any.
    pub fn intersection(&self, other: &DateSpan) -> Option<DateSpan> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateSpan { start, end })
    }

    /// The part of this span strictly after `date`.
    pub fn after(&self, date: NaiveDate) -> Option<DateSpan> {
        let start = date.succ_opt()?.max(self.start);
        (start <= self.end).then_some(DateSpan {
            start,
            end: self.end,
        })
    }

    /// Leading sub-span of at most `max_days` days.
    pub fn head(&self, max_days: u32) -> DateSpan {
        let max_days = max_days.max(1);
        let end = self.start + Duration::days(i64::from(max_days) - 1);
        DateSpan {
            start: self.start,
            end: end.min(self.end),
        }
    }

    /// Split into ascending consecutive chunks of at most `max_days` days.
    pub fn chunks(&self, max_days: u32) -> Vec<DateSpan> {
        let mut chunks = Vec::new();
        let mut remaining = Some(*self);
        while let Some(span) = remaining {
            let head = span.head(max_days);
            chunks.push(head);
            remaining = span.after(head.end);
        }
        chunks
    }
}

impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl FromStr for DateSpan {
    type Err = String;

    /// Parse `YYYY-MM-DD..YYYY-MM-DD` or a single `YYYY-MM-DD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |value: &str| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                .map_err(|e| format!("invalid date '{value}': {e}"))
        };
        match s.split_once("..") {
            Some((start, end)) => DateSpan::new(parse(start)?, parse(end)?),
            None => Ok(DateSpan::single(parse(s)?)),
        }
    }
}

/// One status reading of a PV system.
///
/// Numeric fields are optional: PVOutput reports `NaN` or leaves a column
/// empty when the owner did not upload that measurement. Batch status rows
/// only carry energy, power, temperature and voltage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    /// Local timestamp of the reading
    pub datetime: NaiveDateTime,
    /// Energy generated so far that day (Wh)
    #[serde(rename = "cumulative_energy_gen_Wh")]
    pub cumulative_energy_gen_wh: Option<f64>,
    /// Efficiency (kWh/kW)
    #[serde(rename = "energy_efficiency_kWh_per_kW")]
    pub energy_efficiency_kwh_per_kw: Option<f64>,
    /// Instantaneous power generation (W)
    #[serde(rename = "instantaneous_power_gen_W")]
    pub instantaneous_power_gen_w: Option<f64>,
    /// Average power generation over the interval (W)
    #[serde(rename = "average_power_gen_W")]
    pub average_power_gen_w: Option<f64>,
    /// Normalised power output
    pub power_gen_normalised: Option<f64>,
    /// Energy consumed (Wh)
    #[serde(rename = "energy_consumption_Wh")]
    pub energy_consumption_wh: Option<f64>,
    /// Power demand (W)
    #[serde(rename = "power_demand_W")]
    pub power_demand_w: Option<f64>,
    /// Temperature (C)
    #[serde(rename = "temperature_C")]
    pub temperature_c: Option<f64>,
    /// Voltage
    pub voltage: Option<f64>,
}

impl StatusRecord {
    /// Record with only a timestamp set.
    pub fn empty(datetime: NaiveDateTime) -> Self {
        Self {
            datetime,
            cumulative_energy_gen_wh: None,
            energy_efficiency_kwh_per_kw: None,
            instantaneous_power_gen_w: None,
            average_power_gen_w: None,
            power_gen_normalised: None,
            energy_consumption_wh: None,
            power_demand_w: None,
            temperature_c: None,
            voltage: None,
        }
    }

    /// Local calendar date of the reading
    pub fn date(&self) -> NaiveDate {
        self.datetime.date()
    }
}

/// System metadata as returned by `getsystem`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetadata {
    /// PVOutput system id
    pub system_id: SystemId,
    /// System name
    pub name: String,
    /// DC capacity (W)
    #[serde(rename = "system_DC_capacity_W")]
    pub system_dc_capacity_w: Option<f64>,
    /// Postcode or address
    pub address: String,
    /// Number of panels
    pub num_panels: Option<u32>,
    /// Capacity of each panel (W)
    #[serde(rename = "panel_capacity_W_each")]
    pub panel_capacity_w_each: Option<f64>,
    /// Panel brand
    pub panel_brand: String,
    /// Number of inverters
    pub num_inverters: Option<u32>,
    /// Inverter capacity (W)
    #[serde(rename = "inverter_capacity_W")]
    pub inverter_capacity_w: Option<f64>,
    /// Inverter brand
    pub inverter_brand: String,
    /// Orientation (e.g. "N", "NE")
    pub orientation: String,
    /// Array tilt
    pub array_tilt_degrees: Option<f64>,
    /// Shade description
    pub shade: String,
    /// Installation date
    pub install_date: Option<NaiveDate>,
    /// Latitude
    pub latitude: Option<f64>,
    /// Longitude
    pub longitude: Option<f64>,
    /// Status upload interval (minutes)
    pub status_interval_minutes: Option<u32>,
    /// Panels in the secondary array
    pub secondary_num_panels: Option<u32>,
    /// Capacity of each secondary panel (W)
    #[serde(rename = "secondary_panel_capacity_W_each")]
    pub secondary_panel_capacity_w_each: Option<f64>,
    /// Orientation of the secondary array
    pub secondary_orientation: String,
    /// Tilt of the secondary array
    pub secondary_array_tilt_degrees: Option<f64>,
}

/// Summary statistics as returned by `getstatistic`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStatistic {
    /// PVOutput system id
    pub system_id: SystemId,
    /// Total energy generated (Wh)
    pub total_energy_gen_wh: Option<f64>,
    /// Energy exported (Wh)
    pub energy_exported_wh: Option<f64>,
    /// Average daily generation (Wh)
    pub average_daily_energy_gen_wh: Option<f64>,
    /// Minimum daily generation (Wh)
    pub minimum_daily_energy_gen_wh: Option<f64>,
    /// Maximum daily generation (Wh)
    pub maximum_daily_energy_gen_wh: Option<f64>,
    /// Average efficiency (kWh/kW)
    pub average_efficiency_kwh_per_kw: Option<f64>,
    /// Days with at least one reading
    pub num_outputs: Option<u32>,
    /// First date with data
    pub actual_date_from: Option<NaiveDate>,
    /// Last date with data
    pub actual_date_to: Option<NaiveDate>,
    /// Best efficiency recorded (kWh/kW)
    pub record_efficiency_kwh_per_kw: Option<f64>,
    /// Date of the best efficiency
    pub record_efficiency_date: Option<NaiveDate>,
}

impl SystemStatistic {
    /// Span of dates for which the provider holds data, when known.
    pub fn data_span(&self) -> Option<DateSpan> {
        DateSpan::new(self.actual_date_from?, self.actual_date_to?).ok()
    }

    /// Share of days in [`data_span`](Self::data_span) that have output,
    /// when both are known.
    pub fn data_availability(&self) -> Option<f64> {
        let outputs = self.num_outputs?;
        Some(f64::from(outputs) / f64::from(self.data_span()?.days()))
    }
}

/// One row of a `search` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    /// PVOutput system id
    pub system_id: SystemId,
    /// System name
    pub name: String,
    /// DC capacity (W)
    pub system_dc_capacity_w: Option<f64>,
    /// Postcode, optionally prefixed by country
    pub address: String,
    /// Orientation
    pub orientation: String,
    /// Number of days with output
    pub num_outputs: Option<u32>,
    /// Time since last output, as reported ("2 days ago")
    pub last_output: String,
    /// Panel description
    pub panel: String,
    /// Inverter description
    pub inverter: String,
    /// Distance from the search point (km)
    pub distance_km: Option<f64>,
    /// Latitude
    pub latitude: Option<f64>,
    /// Longitude
    pub longitude: Option<f64>,
}
