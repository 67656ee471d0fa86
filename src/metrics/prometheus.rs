//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by validator-pulse and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all validator-pulse metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Broker submissions, labeled by outcome (accepted, duplicate, rate_limited).
pub static BROKER_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Requests awaiting a correlated response.
pub static PENDING_REQUESTS: OnceLock<Gauge> = OnceLock::new();

/// Responses forwarded by processors, labeled by status class (2xx, 4xx, ...).
pub static PROCESSOR_RESPONSES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// 429 retries performed by processors.
pub static PROCESSOR_RETRIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// HTTP round-trip latency in seconds, including retries.
pub static PROCESSOR_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs written for the worker runtime, labeled by queue and kind.
pub static JOBS_ENQUEUED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Daemon poll cycles, labeled by daemon and result.
pub static DAEMON_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling again is harmless: registration into a fresh
/// registry succeeds and the statics keep their first values.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction or registration
/// fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let broker_requests_total = CounterVec::new(
        Opts::new(
            "validator_pulse_broker_requests_total",
            "Requests submitted to the broker",
        ),
        &["outcome"],
    )?;

    let pending_requests = Gauge::new(
        "validator_pulse_pending_requests",
        "Requests awaiting a correlated response",
    )?;

    let processor_responses_total = CounterVec::new(
        Opts::new(
            "validator_pulse_processor_responses_total",
            "Responses forwarded by request processors",
        ),
        &["status_class"],
    )?;

    let processor_retries_total = IntCounter::new(
        "validator_pulse_processor_retries_total",
        "Rate-limit retries performed by request processors",
    )?;

    let processor_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "validator_pulse_processor_latency_seconds",
            "HTTP round-trip latency including retries",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["status_class"],
    )?;

    let jobs_enqueued_total = CounterVec::new(
        Opts::new(
            "validator_pulse_jobs_enqueued_total",
            "Jobs written for the worker runtime",
        ),
        &["queue", "kind"],
    )?;

    let daemon_runs_total = CounterVec::new(
        Opts::new("validator_pulse_daemon_runs_total", "Daemon poll cycles"),
        &["daemon", "result"],
    )?;

    registry.register(Box::new(broker_requests_total.clone()))?;
    registry.register(Box::new(pending_requests.clone()))?;
    registry.register(Box::new(processor_responses_total.clone()))?;
    registry.register(Box::new(processor_retries_total.clone()))?;
    registry.register(Box::new(processor_latency.clone()))?;
    registry.register(Box::new(jobs_enqueued_total.clone()))?;
    registry.register(Box::new(daemon_runs_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = BROKER_REQUESTS_TOTAL.set(broker_requests_total);
    let _ = PENDING_REQUESTS.set(pending_requests);
    let _ = PROCESSOR_RESPONSES_TOTAL.set(processor_responses_total);
    let _ = PROCESSOR_RETRIES_TOTAL.set(processor_retries_total);
    let _ = PROCESSOR_LATENCY.set(processor_latency);
    let _ = JOBS_ENQUEUED_TOTAL.set(jobs_enqueued_total);
    let _ = DAEMON_RUNS_TOTAL.set(daemon_runs_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
