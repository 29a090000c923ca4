//! Observability metrics for the download engine
//!
//! Counters and histograms are emitted through the `metrics` facade and cost
//! nothing until a recorder is installed. [`init_metrics`] installs the
//! Prometheus exporter when the operator asks for it with `--metrics-addr`.
//!
//! ## What is recorded
//!
//! - Provider requests by kind and classified outcome, with latency
//! - Quota waits and the locally tracked remaining quota
//! - Retry backoffs of transient failures
//! - Dates skipped through the missing-date ledger and dates added to it
//! - Per-system completion, failure and cancellation

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::fetcher::FetchKind;
use crate::SystemId;

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize metrics system with Prometheus exporter
///
/// Idempotent: later calls are no-ops.
///
/// # Arguments
/// * `addr` - Socket address to bind the Prometheus scrape endpoint (e.g. "0.0.0.0:9090")
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
        METRICS_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(format!("Failed to install Prometheus exporter: {e}"));
    }

    describe_counter!(
        "provider_requests_total",
        Unit::Count,
        "Requests sent to PVOutput, by kind and classified outcome"
    );
    describe_histogram!(
        "provider_request_duration_seconds",
        Unit::Seconds,
        "PVOutput request duration in seconds"
    );
    describe_counter!(
        "quota_waits_total",
        Unit::Count,
        "Times the engine suspended work until the quota window reset"
    );
    describe_histogram!(
        "quota_wait_duration_seconds",
        Unit::Seconds,
        "Planned duration of quota waits"
    );
    describe_gauge!(
        "quota_remaining",
        Unit::Count,
        "Requests left in the locally tracked quota window"
    );
    describe_counter!(
        "unit_retries_total",
        Unit::Count,
        "Retries of fetch units after transient failures"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Backoff before retrying a fetch unit"
    );
    describe_counter!(
        "ledger_skipped_dates_total",
        Unit::Count,
        "Dates skipped without a request because they are known to be empty"
    );
    describe_counter!(
        "ledger_recorded_dates_total",
        Unit::Count,
        "Dates newly recorded as having no data"
    );
    describe_counter!(
        "units_failed_total",
        Unit::Count,
        "Fetch units abandoned after exhausting retries or polls"
    );
    describe_counter!(
        "systems_completed_total",
        Unit::Count,
        "Systems whose target span was fully processed"
    );
    describe_counter!(
        "systems_failed_total",
        Unit::Count,
        "Systems aborted by a permanent error"
    );

    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if the Prometheus exporter is installed
pub fn is_initialized() -> bool {
    METRICS_INITIALIZED.load(Ordering::SeqCst)
}

/// Generate a new correlation ID for request tracing
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Times one provider request and records its outcome.
pub struct RequestMetrics {
    kind: FetchKind,
    start_time: Instant,
    correlation_id: String,
}

impl RequestMetrics {
    /// Start timing a request
    pub fn start(kind: FetchKind) -> Self {
        let correlation_id = generate_correlation_id();
        debug!(correlation_id = %correlation_id, kind = %kind, "Starting provider request");
        Self {
            kind,
            start_time: Instant::now(),
            correlation_id,
        }
    }

    /// Record completion with the classified outcome label
    pub fn record_outcome(&self, outcome: &'static str, status: Option<u16>) {
        let duration = self.start_time.elapsed();

        counter!(
            "provider_requests_total",
            "kind" => self.kind.as_str(),
            "outcome" => outcome,
        )
        .increment(1);

        histogram!(
            "provider_request_duration_seconds",
            "kind" => self.kind.as_str(),
        )
        .record(duration.as_secs_f64());

        debug!(
            correlation_id = %self.correlation_id,
            kind = %self.kind,
            outcome = outcome,
            status = ?status,
            duration_ms = duration.as_millis(),
            "Provider request completed"
        );
    }

    /// Correlation ID of this request
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Record a suspension until the quota window resets
pub fn record_quota_wait(duration: Duration) {
    counter!("quota_waits_total").increment(1);
    histogram!("quota_wait_duration_seconds").record(duration.as_secs_f64());
}

/// Update the remaining-quota gauge
pub fn record_quota_remaining(remaining: u32) {
    gauge!("quota_remaining").set(f64::from(remaining));
}

/// Record retry backoff duration
pub fn record_retry_backoff(kind: FetchKind, duration: Duration, attempt: u32) {
    counter!(
        "unit_retries_total",
        "kind" => kind.as_str(),
    )
    .increment(1);

    histogram!(
        "retry_backoff_duration_seconds",
        "attempt" => attempt.to_string(),
    )
    .record(duration.as_secs_f64());

    debug!(
        kind = %kind,
        attempt = attempt,
        backoff_ms = duration.as_millis(),
        "Retry backoff recorded"
    );
}

/// Record dates skipped because the ledger knows they are empty
pub fn record_ledger_skips(count: u64) {
    if count > 0 {
        counter!("ledger_skipped_dates_total").increment(count);
    }
}

/// Record dates newly added to the ledger
pub fn record_ledger_additions(count: u64) {
    if count > 0 {
        counter!("ledger_recorded_dates_total").increment(count);
    }
}

/// Record an abandoned fetch unit
pub fn record_unit_failure(kind: FetchKind) {
    counter!("units_failed_total", "kind" => kind.as_str()).increment(1);
}

/// Per-system download metrics
pub struct SystemMetrics {
    system_id: SystemId,
    start_time: Instant,
}

impl SystemMetrics {
    /// Start tracking a system
    pub fn start(system_id: SystemId) -> Self {
        debug!(system_id = %system_id, "System download started");
        Self {
            system_id,
            start_time: Instant::now(),
        }
    }

    /// Record a completed system
    pub fn record_success(&self, records: u64, failed_units: usize) {
        counter!("systems_completed_total").increment(1);
        info!(
            system_id = %self.system_id,
            records = records,
            failed_units = failed_units,
            duration_secs = self.start_time.elapsed().as_secs(),
            "System download completed"
        );
    }

    /// Record a system aborted by a permanent error
    pub fn record_failure(&self, error: &str) {
        counter!("systems_failed_total").increment(1);
        error!(
            system_id = %self.system_id,
            error = %error,
            duration_secs = self.start_time.elapsed().as_secs(),
            "System download failed"
        );
    }
}
