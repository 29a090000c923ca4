//! PVOutput HTTP client
//!
//! Issues exactly one HTTP request per call and reduces whatever comes back
//! to a [`FetchOutcome`]. There is no retry loop here: retries, polling and
//! quota waits are the scheduler's business, so every attempt stays visible
//! to the quota governor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::pvoutput_config::{
    self, Credentials, BASE_URL, BATCH_STATUS_SERVICE, HEADER_API_KEY, HEADER_RATE_LIMIT,
    HEADER_RATE_LIMIT_LIMIT, HEADER_RATE_LIMIT_REMAINING, HEADER_RATE_LIMIT_RESET,
    HEADER_SYSTEM_ID, SEARCH_SERVICE, STATISTIC_SERVICE, STATUS_ROW_LIMIT, STATUS_SERVICE,
    SYSTEM_SERVICE,
};
use super::pvoutput_parser::{self, format_date};
use super::retry_formatter::extract_error_type;
use super::{
    FetchOutcome, FetchResponse, FetchUnit, FetcherError, FetcherResult, Payload, ProviderClient,
    ProviderQuota,
};
use crate::metrics::RequestMetrics;
use crate::{DateSpan, SearchResult, SystemId, SystemStatistic};

/// HTTP connect timeout (seconds) - time to establish TCP connection
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds) - overall time for the entire request
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Build the HTTP client used for PVOutput requests.
///
/// Configured with explicit timeouts to prevent indefinite hangs:
/// - Connect timeout: 10 seconds
/// - Request timeout: 30 seconds
pub fn build_http_client() -> FetcherResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
        .user_agent(concat!("pvoutput-backfill/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| {
            FetcherError::ConfigurationError(format!(
                "failed to build HTTP client: {e}. Check system TLS configuration."
            ))
        })
}

/// How a raw response should be treated, before any parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    /// Body holds data
    Content,
    /// Provider reports no data for the request
    NoData,
    /// Provider quota exhausted
    RateLimited,
    /// Batch request queued; poll again
    Accepted,
    /// Worth retrying
    Transient(String),
    /// Retrying will not help
    Permanent(String),
}

/// Classify a response from its status, rate-limit headers and body.
///
/// PVOutput reports quota exhaustion as a 403 with an "Exceeded N requests
/// per hour" message, and a date without readings as a 400 "No status found".
pub fn classify(status: StatusCode, quota: Option<&ProviderQuota>, body: &str) -> ResponseClass {
    let code = status.as_u16();
    if code == 202 || body.contains("Accepted 202") {
        return ResponseClass::Accepted;
    }

    let lower = body.to_lowercase();
    match code {
        200 => {
            if body.trim().is_empty() {
                ResponseClass::NoData
            } else {
                ResponseClass::Content
            }
        }
        400 if lower.contains("no status found") => ResponseClass::NoData,
        400 => ResponseClass::Permanent(format!("bad request: {}", body.trim())),
        401 => ResponseClass::Permanent(format!("unauthorized: {}", body.trim())),
        403 => {
            let exceeded = lower.contains("exceeded") && lower.contains("requests per hour");
            let drained = quota.map(|q| q.remaining == 0).unwrap_or(false);
            if exceeded || drained {
                ResponseClass::RateLimited
            } else {
                ResponseClass::Permanent(format!("forbidden: {}", body.trim()))
            }
        }
        429 => ResponseClass::RateLimited,
        _ if status.is_server_error() => ResponseClass::Transient(format!(
            "{} ({code})",
            extract_error_type(Some(status), None).description()
        )),
        // Timeouts, 404s from proxies and anything else unlisted
        _ => ResponseClass::Transient(format!(
            "{} ({code}): {}",
            extract_error_type(Some(status), None).description(),
            body.trim()
        )),
    }
}

/// Read `X-Rate-Limit-*` headers, if all three are present and valid.
pub fn parse_quota_headers(headers: &HeaderMap) -> Option<ProviderQuota> {
    let read = |name: &str| -> Option<i64> { headers.get(name)?.to_str().ok()?.trim().parse().ok() };

    let remaining = read(HEADER_RATE_LIMIT_REMAINING)?;
    let limit = read(HEADER_RATE_LIMIT_LIMIT)?;
    let reset = read(HEADER_RATE_LIMIT_RESET)?;
    let reset_at = DateTime::<Utc>::from_timestamp(reset, 0)?;

    Some(ProviderQuota {
        remaining: u32::try_from(remaining.max(0)).ok()?,
        limit: u32::try_from(limit.max(0)).ok()?,
        reset_at,
    })
}

/// Decode a body as ISO-8859-1, which is what PVOutput sends.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Raw response after transport succeeded
struct RawResponse {
    status: StatusCode,
    quota: Option<ProviderQuota>,
    body: String,
}

/// Client for the PVOutput service API and data service.
pub struct PvOutputClient {
    client: Arc<Client>,
    base_url: String,
    data_service_url: Option<String>,
    credentials: Credentials,
}

impl PvOutputClient {
    /// Create a client against the public PVOutput host.
    pub fn new(credentials: Credentials) -> FetcherResult<Self> {
        let client = Arc::new(build_http_client()?);
        Ok(Self {
            client,
            base_url: BASE_URL.to_string(),
            data_service_url: credentials.data_service_url().map(str::to_string),
            credentials,
        })
    }

    /// Share an existing HTTP client
    pub fn with_http_client(mut self, client: Arc<Client>) -> Self {
        self.client = client;
        self
    }

    /// Point the service API at another host (mirrors, test servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Point the data service at another host. Not validated.
    pub fn with_data_service_url(mut self, url: impl Into<String>) -> Self {
        self.data_service_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    /// Whether batch status requests can be made
    pub fn has_batch_access(&self) -> bool {
        self.data_service_url.is_some()
    }

    /// Search systems by free text, optionally near a coordinate.
    pub async fn search(
        &self,
        query: &str,
        near: Option<(f64, f64)>,
    ) -> FetcherResult<Vec<SearchResult>> {
        let mut params = vec![("q", query.to_string()), ("country", "1".to_string())];
        if let Some((lat, lon)) = near {
            params.push(("ll", format!("{lat:.6},{lon:.6}")));
        }

        let url = pvoutput_config::service_url(&self.base_url, SEARCH_SERVICE);
        let raw = self.send_checked(&url, &params).await?;
        match raw {
            Some(body) => pvoutput_parser::parse_search(&body),
            None => Ok(Vec::new()),
        }
    }

    /// Summary statistics of a system, over its lifetime or a span.
    pub async fn get_statistic(
        &self,
        system_id: SystemId,
        span: Option<DateSpan>,
    ) -> FetcherResult<Option<SystemStatistic>> {
        let mut params = statistic_params(system_id);
        if let Some(span) = span {
            params.push(("df", format_date(span.start())));
            params.push(("dt", format_date(span.end())));
        }

        let url = pvoutput_config::service_url(&self.base_url, STATISTIC_SERVICE);
        match self.send_checked(&url, &params).await? {
            Some(body) => pvoutput_parser::parse_statistic(system_id, &body),
            None => Ok(None),
        }
    }

    /// Send a request and turn anything but content into an error.
    /// `Ok(None)` means the provider had no data.
    async fn send_checked(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> FetcherResult<Option<String>> {
        let raw = self
            .send(url, params)
            .await
            .map_err(|e| FetcherError::HttpError(extract_error_type(None, Some(&e)).description().to_string()))?;

        match classify(raw.status, raw.quota.as_ref(), &raw.body) {
            ResponseClass::Content => Ok(Some(raw.body)),
            ResponseClass::NoData => Ok(None),
            ResponseClass::RateLimited => Err(FetcherError::RateLimitExceeded {
                reset_at: raw.quota.map(|q| q.reset_at),
            }),
            ResponseClass::Accepted => Err(FetcherError::NotReady),
            ResponseClass::Transient(message) => Err(FetcherError::HttpError(message)),
            ResponseClass::Permanent(message) => Err(FetcherError::ApiError {
                status: raw.status.as_u16(),
                message,
            }),
        }
    }

    async fn send(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<RawResponse, reqwest::Error> {
        debug!(url = %url, params = params.len(), "Sending PVOutput request");

        let response = self
            .client
            .get(url)
            .header(HEADER_RATE_LIMIT, "1")
            .header(HEADER_API_KEY, self.credentials.api_key())
            .header(HEADER_SYSTEM_ID, self.credentials.system_id())
            .query(params)
            .send()
            .await?;

        let status = response.status();
        let quota = parse_quota_headers(response.headers());
        let bytes = response.bytes().await?;

        Ok(RawResponse {
            status,
            quota,
            body: decode_latin1(&bytes),
        })
    }

    /// URL and query of a fetch unit, or the reason it cannot be requested.
    fn request_for(&self, unit: &FetchUnit) -> Result<(String, Vec<(&'static str, String)>), String> {
        match unit {
            FetchUnit::TimeSeries { system_id, date } => Ok((
                pvoutput_config::service_url(&self.base_url, STATUS_SERVICE),
                vec![
                    ("d", format_date(*date)),
                    ("h", "1".to_string()),
                    ("limit", STATUS_ROW_LIMIT.to_string()),
                    ("ext", "0".to_string()),
                    ("sid1", system_id.to_string()),
                ],
            )),
            FetchUnit::BatchStatus { system_id, span } => {
                let dsu = self
                    .data_service_url
                    .as_deref()
                    .ok_or_else(|| "batch status requires a data service URL".to_string())?;
                Ok((
                    pvoutput_config::data_service_url(dsu, BATCH_STATUS_SERVICE),
                    vec![
                        ("key", self.credentials.api_key().to_string()),
                        ("sid", self.credentials.system_id().to_string()),
                        ("dt", format_date(span.end())),
                        ("sid1", system_id.to_string()),
                    ],
                ))
            }
            FetchUnit::Metadata { system_id } => Ok((
                pvoutput_config::service_url(&self.base_url, SYSTEM_SERVICE),
                vec![
                    ("array2", "1".to_string()),
                    ("tariffs", "0".to_string()),
                    ("teams", "0".to_string()),
                    ("est", "0".to_string()),
                    ("donations", "0".to_string()),
                    ("sid1", system_id.to_string()),
                    ("ext", "0".to_string()),
                ],
            )),
            FetchUnit::Statistic { system_id } => Ok((
                pvoutput_config::service_url(&self.base_url, STATISTIC_SERVICE),
                statistic_params(*system_id),
            )),
        }
    }
}

fn statistic_params(system_id: SystemId) -> Vec<(&'static str, String)> {
    vec![
        ("c", "0".to_string()),
        ("crdr", "0".to_string()),
        ("sid1", system_id.to_string()),
    ]
}

/// Parse the body of a content response for the given unit.
fn parse_content(unit: &FetchUnit, body: &str) -> FetchOutcome {
    let parsed = match unit {
        FetchUnit::TimeSeries { .. } => pvoutput_parser::parse_status_history(body).map(Payload::Status),
        FetchUnit::BatchStatus { span, .. } => pvoutput_parser::parse_batch_status(body).map(|rows| {
            Payload::Status(rows.into_iter().filter(|r| span.contains(r.date())).collect())
        }),
        FetchUnit::Metadata { system_id } => {
            pvoutput_parser::parse_metadata(*system_id, body).map(Payload::Metadata)
        }
        FetchUnit::Statistic { system_id } => {
            match pvoutput_parser::parse_statistic(*system_id, body) {
                Ok(Some(statistic)) => Ok(Payload::Statistic(statistic)),
                Ok(None) => return FetchOutcome::Empty,
                Err(e) => Err(e),
            }
        }
    };

    match parsed {
        Ok(Payload::Status(rows)) if rows.is_empty() => FetchOutcome::Empty,
        Ok(payload) => FetchOutcome::Data(payload),
        Err(FetcherError::UnsupportedData(message)) => FetchOutcome::PermanentError(message),
        Err(e) => FetchOutcome::TransientError(format!("malformed response: {e}")),
    }
}

#[async_trait]
impl ProviderClient for PvOutputClient {
    async fn fetch(&self, unit: &FetchUnit) -> FetchResponse {
        let metrics = RequestMetrics::start(unit.kind());

        let (url, params) = match self.request_for(unit) {
            Ok(request) => request,
            Err(message) => {
                let outcome = FetchOutcome::PermanentError(message);
                metrics.record_outcome(outcome.label(), None);
                return FetchResponse::new(outcome);
            }
        };

        let raw = match self.send(&url, &params).await {
            Ok(raw) => raw,
            Err(e) => {
                let description = extract_error_type(None, Some(&e)).description();
                warn!(unit = %unit, error = %e, "PVOutput request failed");
                let outcome = FetchOutcome::TransientError(description.to_string());
                metrics.record_outcome(outcome.label(), None);
                return FetchResponse::new(outcome);
            }
        };

        let outcome = match classify(raw.status, raw.quota.as_ref(), &raw.body) {
            ResponseClass::Content => parse_content(unit, &raw.body),
            ResponseClass::NoData => FetchOutcome::Empty,
            ResponseClass::RateLimited => FetchOutcome::RateLimited {
                reset_at: raw.quota.map(|q| q.reset_at),
            },
            ResponseClass::Accepted => FetchOutcome::Accepted,
            ResponseClass::Transient(message) => FetchOutcome::TransientError(message),
            ResponseClass::Permanent(message) => FetchOutcome::PermanentError(message),
        };

        metrics.record_outcome(outcome.label(), Some(raw.status.as_u16()));
        FetchResponse::new(outcome).with_quota(raw.quota)
    }
}
