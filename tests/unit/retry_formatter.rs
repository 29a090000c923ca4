use std::time::Duration;

use chrono::NaiveDate;
use pvoutput_backfill::fetcher::retry_formatter::{
    extract_error_type, RetryContext, RetryErrorType,
};
use pvoutput_backfill::fetcher::FetchUnit;
use pvoutput_backfill::{DateSpan, SystemId};
use reqwest::StatusCode;

fn batch_unit() -> FetchUnit {
    FetchUnit::BatchStatus {
        system_id: SystemId::new(6112),
        span: DateSpan::new(
            NaiveDate::from_ymd_opt(2019, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2019, 12, 31).unwrap(),
        )
        .unwrap(),
    }
}

fn sample_context(cause: &str) -> RetryContext {
    RetryContext::new(2, 5, Duration::from_secs(4), &batch_unit(), cause)
}

#[test]
fn format_retry_captures_attempt_and_wait() {
    let message = sample_context("service unavailable").format_retry();
    assert!(message.contains("attempt 2/5"));
    assert!(message.contains("service unavailable"));
    assert!(message.contains("4.0 seconds"));
    assert!(message.contains("batch_status 6112"));
    assert!(message.contains("2019-01-01..2019-12-31"));
}

#[test]
fn format_failure_lists_suggestions() {
    let output = sample_context("bad gateway").format_failure();
    assert!(output.contains("batch_status unit failed after 5 retries"));
    assert!(output.contains("Last error: bad gateway"));
    assert!(output.contains("System: 6112"));
    assert!(output.contains("--max-retries"));
    assert!(output.contains("--resume on"));
}

#[test]
fn format_failure_without_dates() {
    let unit = FetchUnit::Metadata {
        system_id: SystemId::new(4232),
    };
    let output = RetryContext::new(1, 3, Duration::ZERO, &unit, "timeout").format_failure();
    assert!(output.contains("Dates: n/a"));
}

#[test]
fn extract_error_type_classifies_status_codes() {
    let invalid = extract_error_type(Some(StatusCode::BAD_REQUEST), None);
    assert!(matches!(invalid, RetryErrorType::InvalidRequest));

    let auth = extract_error_type(Some(StatusCode::FORBIDDEN), None);
    assert!(matches!(auth, RetryErrorType::AuthFailed(403)));

    let rate_limit = extract_error_type(Some(StatusCode::TOO_MANY_REQUESTS), None);
    assert_eq!(rate_limit, RetryErrorType::RateLimit);

    let server = extract_error_type(Some(StatusCode::BAD_GATEWAY), None);
    assert_eq!(server.description(), "bad gateway");
    assert!(server.is_retryable());
}

#[test]
fn suggestions_point_at_credentials_for_auth_failures() {
    assert!(RetryErrorType::AuthFailed(401)
        .suggestion()
        .contains("PVOUTPUT_AUTH_APIKEY"));
    assert!(!RetryErrorType::AuthFailed(401).is_retryable());
}
