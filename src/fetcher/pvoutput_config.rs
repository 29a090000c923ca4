//! PVOutput endpoints, credentials and account tiers
//!
//! - **Service API**: `https://pvoutput.org/service/r2/{service}.jsp`, authenticated
//!   with the `X-Pvoutput-Apikey` and `X-Pvoutput-SystemId` headers
//! - **Data service**: `{data_service_url}/data/r2/getbatchstatus.jsp`, available to
//!   paying subscribers, authenticated with `key` and `sid` query parameters

use std::fmt;
use std::str::FromStr;

/// Default service API host
pub const BASE_URL: &str = "https://pvoutput.org";

/// Status history of one date
pub const STATUS_SERVICE: &str = "getstatus";

/// System metadata
pub const SYSTEM_SERVICE: &str = "getsystem";

/// Summary statistics
pub const STATISTIC_SERVICE: &str = "getstatistic";

/// System search
pub const SEARCH_SERVICE: &str = "search";

/// Year of status history (data service only)
pub const BATCH_STATUS_SERVICE: &str = "getbatchstatus";

/// Date format used in query parameters and response rows
pub const DATE_FORMAT: &str = "%Y%m%d";

/// Readings per day requested from `getstatus` (one per 5 minutes)
pub const STATUS_ROW_LIMIT: u32 = 288;

/// Maximum rows returned by `search`
pub const SEARCH_MAX_RESULTS: usize = 30;

/// Ask the provider to include rate-limit headers
pub const HEADER_RATE_LIMIT: &str = "X-Rate-Limit";
/// API key header
pub const HEADER_API_KEY: &str = "X-Pvoutput-Apikey";
/// Owner system id header
pub const HEADER_SYSTEM_ID: &str = "X-Pvoutput-SystemId";
/// Requests left in the window
pub const HEADER_RATE_LIMIT_REMAINING: &str = "X-Rate-Limit-Remaining";
/// Requests allowed per window
pub const HEADER_RATE_LIMIT_LIMIT: &str = "X-Rate-Limit-Limit";
/// Window reset, unix seconds
pub const HEADER_RATE_LIMIT_RESET: &str = "X-Rate-Limit-Reset";

/// Build the URL of a service API endpoint.
pub fn service_url(base_url: &str, service: &str) -> String {
    format!("{}/service/r2/{service}.jsp", base_url.trim_end_matches('/'))
}

/// Build the URL of a data service endpoint.
pub fn data_service_url(data_service_url: &str, service: &str) -> String {
    format!(
        "{}/data/r2/{service}.jsp",
        data_service_url.trim_end_matches('/')
    )
}

/// Account tier, which decides the hourly request ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaTier {
    /// Free account: 60 requests per hour
    Free,
    /// Donated account: 300 requests per hour
    Donated,
    /// Paid data service subscriber
    Batch,
}

impl QuotaTier {
    /// Default request ceiling per hour
    pub fn requests_per_hour(&self) -> u32 {
        match self {
            QuotaTier::Free => 60,
            QuotaTier::Donated => 300,
            QuotaTier::Batch => 900,
        }
    }

    /// Whether the tier can use the data service batch endpoint
    pub fn uses_batch_endpoint(&self) -> bool {
        matches!(self, QuotaTier::Batch)
    }
}

impl fmt::Display for QuotaTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuotaTier::Free => "free",
            QuotaTier::Donated => "donated",
            QuotaTier::Batch => "batch",
        };
        f.write_str(s)
    }
}

impl FromStr for QuotaTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(QuotaTier::Free),
            "donated" | "donation" => Ok(QuotaTier::Donated),
            "batch" | "paid" => Ok(QuotaTier::Batch),
            _ => Err(format!(
                "Invalid quota tier: {s}. Valid options: free, donated, batch"
            )),
        }
    }
}

/// API credentials and optional data service location.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    system_id: String,
    data_service_url: Option<String>,
}

impl Credentials {
    /// Validate and build credentials.
    ///
    /// `system_id` is the id of the account owner's own system, which
    /// PVOutput uses to authenticate the key. The data service URL, when
    /// given, must be a PVOutput host (ending in `.org`).
    pub fn new(
        api_key: impl Into<String>,
        system_id: impl Into<String>,
        data_service_url: Option<String>,
    ) -> Result<Self, super::FetcherError> {
        let credentials = Self {
            api_key: api_key.into().trim().to_string(),
            system_id: system_id.into().trim().to_string(),
            data_service_url: data_service_url
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
        };
        credentials
            .validate()
            .map_err(super::FetcherError::ConfigurationError)?;
        Ok(credentials)
    }

    /// Validate fields
    pub fn validate(&self) -> Result<(), String> {
        if self.api_key.is_empty() {
            return Err("API key is not set (PVOUTPUT_AUTH_APIKEY)".to_string());
        }
        if self.system_id.is_empty() {
            return Err("system id is not set (PVOUTPUT_AUTH_SYSTEMID)".to_string());
        }
        if let Some(url) = &self.data_service_url {
            if !url.ends_with(".org") {
                return Err(format!("data service URL must end in '.org': {url}"));
            }
        }
        Ok(())
    }

    /// API key
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Owner system id used for authentication
    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    /// Data service URL, when batch access is available
    pub fn data_service_url(&self) -> Option<&str> {
        self.data_service_url.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("system_id", &self.system_id)
            .field("data_service_url", &self.data_service_url)
            .finish()
    }
}
