//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally and tests need no setup.

use super::prometheus::{
    BROKER_REQUESTS_TOTAL, DAEMON_RUNS_TOTAL, JOBS_ENQUEUED_TOTAL, PENDING_REQUESTS,
    PROCESSOR_LATENCY, PROCESSOR_RESPONSES_TOTAL, PROCESSOR_RETRIES_TOTAL,
};

/// Outcome of a broker submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Duplicate,
    RateLimited,
}

impl SubmitOutcome {
    fn label(self) -> &'static str {
        match self {
            SubmitOutcome::Accepted => "accepted",
            SubmitOutcome::Duplicate => "duplicate",
            SubmitOutcome::RateLimited => "rate_limited",
        }
    }
}

/// Label for an HTTP-like status: "2xx", "4xx", ...
pub fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Metrics collector for recording validator-pulse operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a broker submission.
    pub fn record_submission(&self, outcome: SubmitOutcome) {
        if let Some(total) = BROKER_REQUESTS_TOTAL.get() {
            total.with_label_values(&[outcome.label()]).inc();
        }
    }

    /// Set the number of requests awaiting a response.
    pub fn set_pending_requests(&self, pending: usize) {
        if let Some(gauge) = PENDING_REQUESTS.get() {
            gauge.set(pending as f64);
        }
    }

    /// Record a response forwarded by a processor.
    ///
    /// # Arguments
    ///
    /// * `status` - HTTP-like status of the response envelope
    /// * `latency_secs` - Time from pop to push, including retries
    pub fn record_processor_response(&self, status: u16, latency_secs: f64) {
        let class = status_class(status);
        if let Some(total) = PROCESSOR_RESPONSES_TOTAL.get() {
            total.with_label_values(&[class]).inc();
        }
        if let Some(latency) = PROCESSOR_LATENCY.get() {
            latency.with_label_values(&[class]).observe(latency_secs);
        }

        tracing::trace!(status = status, latency_secs = latency_secs, "Recorded processor response");
    }

    /// Record a 429 retry.
    pub fn record_retry(&self) {
        if let Some(retries) = PROCESSOR_RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    /// Record a job written for the worker runtime.
    pub fn record_job_enqueued(&self, queue: &str, scheduled: bool) {
        let kind = if scheduled { "scheduled" } else { "immediate" };
        if let Some(total) = JOBS_ENQUEUED_TOTAL.get() {
            total.with_label_values(&[queue, kind]).inc();
        }
    }

    /// Record a daemon poll cycle.
    pub fn record_daemon_run(&self, daemon: &str, success: bool) {
        let result = if success { "success" } else { "failure" };
        if let Some(total) = DAEMON_RUNS_TOTAL.get() {
            total.with_label_values(&[daemon, result]).inc();
        }
    }
}
