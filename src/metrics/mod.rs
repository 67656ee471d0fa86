//! Metrics module for Prometheus-based monitoring.
//!
//! Counters cover broker submissions, processor responses and retries, jobs
//! written for the worker runtime, and daemon poll cycles.
//!
//! # Example
//!
//! ```ignore
//! use validator_pulse::metrics::{init_metrics, export_metrics, MetricsCollector, SubmitOutcome};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_submission(SubmitOutcome::Accepted);
//!
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{status_class, MetricsCollector, SubmitOutcome};
pub use prometheus::{export_metrics, init_metrics};
