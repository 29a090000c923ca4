//! Failure classification and retry message formatting.
//!
//! [`RetryErrorType`] turns an HTTP status or transport error into a short
//! description and decides whether it is worth retrying. [`RetryContext`]
//! formats the log lines the download loop emits while it retries a unit
//! and when it gives up on one.

use reqwest::{Error as ReqwestError, StatusCode};
use std::time::Duration;

use super::FetchKind;
use crate::{DateSpan, SystemId};

/// Classification of request failures for user messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Network timeout or connection stalled long enough to trigger a timeout
    NetworkTimeout,
    /// Connection refused, DNS failure, or other offline scenarios
    NetworkOffline,
    /// Hourly request quota exhausted
    RateLimit,
    /// HTTP 5xx server error
    ServerError(u16),
    /// HTTP 400 invalid request
    InvalidRequest,
    /// Authentication failures (401/403)
    AuthFailed(u16),
    /// Other client errors (4xx)
    ClientError(u16),
    /// Response body could not be understood
    MalformedResponse,
    /// Generic fallback when no better classification fits
    NetworkGeneric,
}

impl RetryErrorType {
    /// User-friendly description string used inside retry log messages.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network timeout",
            Self::NetworkOffline => "connection failed",
            Self::RateLimit => "request quota exhausted",
            Self::ServerError(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::InvalidRequest => "invalid request",
            Self::AuthFailed(code) => match code {
                401 => "authentication failed (401)",
                403 => "access denied (403)",
                _ => "authentication failed",
            },
            Self::ClientError(code) => match code {
                404 => "resource not found",
                405 => "method not allowed",
                _ => "client error",
            },
            Self::MalformedResponse => "malformed response",
            Self::NetworkGeneric => "network error",
        }
    }

    /// Suggested remediation presented after failures.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "Check your network connection and firewall settings",
            Self::NetworkOffline => "Verify internet connectivity and DNS resolution",
            Self::RateLimit => "Lower --max-requests-per-hour or let the run wait for the reset",
            Self::ServerError(_) => "PVOutput may be experiencing issues, try again later",
            Self::InvalidRequest => "Check the system id and date range for typos",
            Self::AuthFailed(_) => {
                "Verify PVOUTPUT_AUTH_APIKEY and PVOUTPUT_AUTH_SYSTEMID, and that the key has API access enabled"
            }
            Self::ClientError(_) => "Review request parameters against https://pvoutput.org/help/api_specification.html",
            Self::MalformedResponse => "Re-run later; persistent failures may indicate an API change",
            Self::NetworkGeneric => "Check network connectivity and try again",
        }
    }

    /// Determine whether the error type is typically retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RetryErrorType::InvalidRequest | RetryErrorType::AuthFailed(_)
        )
    }
}

/// Extract a [`RetryErrorType`] from an HTTP status or reqwest error.
pub fn extract_error_type(
    status: Option<StatusCode>,
    err: Option<&ReqwestError>,
) -> RetryErrorType {
    if let Some(status) = status {
        match status.as_u16() {
            400 => return RetryErrorType::InvalidRequest,
            408 => return RetryErrorType::NetworkTimeout,
            401 | 403 => return RetryErrorType::AuthFailed(status.as_u16()),
            429 => return RetryErrorType::RateLimit,
            _ => {}
        }

        if status.is_server_error() {
            return RetryErrorType::ServerError(status.as_u16());
        }

        if status.is_client_error() {
            return RetryErrorType::ClientError(status.as_u16());
        }
    }

    if let Some(err) = err {
        if err.is_timeout() {
            return RetryErrorType::NetworkTimeout;
        }

        if err.is_connect() {
            return RetryErrorType::NetworkOffline;
        }

        if err.is_decode() || err.is_body() {
            return RetryErrorType::MalformedResponse;
        }
    }

    RetryErrorType::NetworkGeneric
}

/// Context for formatting retry messages about one fetch unit.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Current retry number (1-based)
    pub attempt: u32,
    /// Maximum number of retries configured
    pub max_attempts: u32,
    /// Backoff duration until next attempt
    pub backoff_duration: Duration,
    /// System being downloaded
    pub system_id: SystemId,
    /// Request kind
    pub kind: FetchKind,
    /// Dates covered by the unit
    pub span: Option<DateSpan>,
    /// Cause reported for the last failure
    pub cause: String,
}

impl RetryContext {
    /// Build a context for the given unit.
    pub fn new(
        attempt: u32,
        max_attempts: u32,
        backoff_duration: Duration,
        unit: &super::FetchUnit,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            attempt,
            max_attempts,
            backoff_duration,
            system_id: unit.system_id(),
            kind: unit.kind(),
            span: unit.span(),
            cause: cause.into(),
        }
    }

    /// Format standardized retry message with attempt counters and context.
    pub fn format_retry(&self) -> String {
        let mut message = format!(
            "Retrying (attempt {}/{}) after {} - waiting {:.1} seconds...",
            self.attempt,
            self.max_attempts,
            self.cause,
            self.backoff_duration.as_secs_f64()
        );
        self.append_unit(&mut message);
        message
    }

    /// Format final failure summary with actionable suggestions.
    pub fn format_failure(&self) -> String {
        let mut lines = vec![format!(
            "[FAILED] {} unit failed after {} retries",
            self.kind, self.max_attempts
        )];
        lines.push(format!("  Last error: {}", self.cause));
        lines.push(format!("  System: {}", self.system_id));
        let span = self
            .span
            .map(|s| s.to_string())
            .unwrap_or_else(|| "n/a".to_string());
        lines.push(format!("  Dates: {span}"));
        lines.push("  Suggestions:".to_string());
        for suggestion in self.format_suggestions() {
            lines.push(format!("    - {suggestion}"));
        }
        lines.join("\n")
    }

    /// Suggestions shown with a failure summary.
    pub fn format_suggestions(&self) -> Vec<String> {
        vec![
            "The unit is kept in the resume state and retried on the next run with --resume on"
                .to_string(),
            format!(
                "Try increasing --max-retries (current: {})",
                self.max_attempts
            ),
            "Check PVOutput status at https://pvoutput.org".to_string(),
        ]
    }

    fn append_unit(&self, buffer: &mut String) {
        buffer.push_str(&format!(" ({} {}", self.kind, self.system_id));
        if let Some(span) = self.span {
            buffer.push(' ');
            buffer.push_str(&span.to_string());
        }
        buffer.push(')');
    }
}
