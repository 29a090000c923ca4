//! Provider access: fetch units, classified outcomes and the PVOutput client
//!
//! The engine never looks at HTTP status codes. Every call made on its
//! behalf is reduced to a [`FetchOutcome`], and the scheduler decides what to
//! do from that alone.

use crate::{DateSpan, StatusRecord, SystemId, SystemMetadata, SystemStatistic};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod pvoutput_config;
pub mod pvoutput_http;
pub mod pvoutput_parser;
pub mod retry_formatter;

pub use pvoutput_http::PvOutputClient;

/// Fetcher errors
#[derive(Debug, thiserror::Error)]
pub enum FetcherError {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Response body could not be parsed
    #[error("parse error: {0}")]
    ParseError(String),

    /// Response holds data this client cannot represent
    #[error("unsupported data: {0}")]
    UnsupportedData(String),

    /// Provider rejected the request
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status
        status: u16,
        /// Response body
        message: String,
    },

    /// Provider quota exhausted
    #[error("rate limit exceeded (reset at {reset_at:?})")]
    RateLimitExceeded {
        /// Reset time reported by the provider
        reset_at: Option<DateTime<Utc>>,
    },

    /// Batch request accepted but not ready yet
    #[error("request accepted, data not ready yet")]
    NotReady,

    /// Client misconfiguration (credentials, URLs)
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for fetcher operations
pub type FetcherResult<T> = Result<T, FetcherError>;

/// Request kind of a fetch unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    /// One day of status history (`getstatus`)
    TimeSeries,
    /// Up to a year of status history from the data service (`getbatchstatus`)
    BatchStatus,
    /// System metadata (`getsystem`)
    Metadata,
    /// Lifetime summary (`getstatistic`)
    Statistic,
}

impl FetchKind {
    /// Stable lowercase label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchKind::TimeSeries => "time_series",
            FetchKind::BatchStatus => "batch_status",
            FetchKind::Metadata => "metadata",
            FetchKind::Statistic => "statistic",
        }
    }
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smallest schedulable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchUnit {
    /// Status history of one date
    TimeSeries {
        /// System
        system_id: SystemId,
        /// Local date
        date: NaiveDate,
    },
    /// Status history of a multi-date span, requested in one call
    BatchStatus {
        /// System
        system_id: SystemId,
        /// Dates to keep from the response
        span: DateSpan,
    },
    /// System metadata
    Metadata {
        /// System
        system_id: SystemId,
    },
    /// Lifetime statistic, used to narrow a span to dates with data
    Statistic {
        /// System
        system_id: SystemId,
    },
}

impl FetchUnit {
    /// System the unit belongs to
    pub fn system_id(&self) -> SystemId {
        match self {
            FetchUnit::TimeSeries { system_id, .. }
            | FetchUnit::BatchStatus { system_id, .. }
            | FetchUnit::Metadata { system_id }
            | FetchUnit::Statistic { system_id } => *system_id,
        }
    }

    /// Request kind
    pub fn kind(&self) -> FetchKind {
        match self {
            FetchUnit::TimeSeries { .. } => FetchKind::TimeSeries,
            FetchUnit::BatchStatus { .. } => FetchKind::BatchStatus,
            FetchUnit::Metadata { .. } => FetchKind::Metadata,
            FetchUnit::Statistic { .. } => FetchKind::Statistic,
        }
    }

    /// Dates covered, `None` for metadata and statistic units.
    pub fn span(&self) -> Option<DateSpan> {
        match self {
            FetchUnit::TimeSeries { date, .. } => Some(DateSpan::single(*date)),
            FetchUnit::BatchStatus { span, .. } => Some(*span),
            FetchUnit::Metadata { .. } | FetchUnit::Statistic { .. } => None,
        }
    }
}

impl fmt::Display for FetchUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span() {
            Some(span) if span.days() == 1 => {
                write!(f, "{} {} {}", self.kind(), self.system_id(), span.start())
            }
            Some(span) => write!(f, "{} {} {}", self.kind(), self.system_id(), span),
            None => write!(f, "{} {}", self.kind(), self.system_id()),
        }
    }
}

/// Content of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Status readings, sorted by time
    Status(Vec<StatusRecord>),
    /// System metadata
    Metadata(SystemMetadata),
    /// Summary statistic
    Statistic(SystemStatistic),
}

/// Classified result of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Success with content
    Data(Payload),
    /// Provider says there is no data for this unit
    Empty,
    /// Quota rejection; never a failure of the unit
    RateLimited {
        /// Provider reset time, when reported
        reset_at: Option<DateTime<Utc>>,
    },
    /// Batch request accepted, poll again later
    Accepted,
    /// Network, 5xx or malformed response; retryable
    TransientError(String),
    /// Authentication or malformed request; not retryable
    PermanentError(String),
}

impl FetchOutcome {
    /// Stable lowercase label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Data(_) => "data",
            FetchOutcome::Empty => "empty",
            FetchOutcome::RateLimited { .. } => "rate_limited",
            FetchOutcome::Accepted => "accepted",
            FetchOutcome::TransientError(_) => "transient_error",
            FetchOutcome::PermanentError(_) => "permanent_error",
        }
    }
}

/// Rate-limit state reported in response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderQuota {
    /// Requests left in the provider's window
    pub remaining: u32,
    /// Provider's ceiling
    pub limit: u32,
    /// When the provider's window resets
    pub reset_at: DateTime<Utc>,
}

/// Outcome of a call plus whatever quota information came with it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// Classified outcome
    pub outcome: FetchOutcome,
    /// Rate-limit headers, when present
    pub quota: Option<ProviderQuota>,
}

impl FetchResponse {
    /// Response without quota information
    pub fn new(outcome: FetchOutcome) -> Self {
        Self {
            outcome,
            quota: None,
        }
    }

    /// Attach quota information
    pub fn with_quota(mut self, quota: Option<ProviderQuota>) -> Self {
        self.quota = quota;
        self
    }
}

/// Issues single logical requests against the provider.
///
/// Implementations hold no state between calls beyond connection pooling
/// and must never panic or return early on provider errors: every failure
/// is expressed as a [`FetchOutcome`].
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Execute one fetch unit
    async fn fetch(&self, unit: &FetchUnit) -> FetchResponse;
}
