//! Request processor: the only component that talks to remote APIs.
//!
//! A processor pops request envelopes from `request_queue`, performs the
//! HTTP call, and pushes exactly one response envelope onto the queue named
//! by the request. 429 responses are retried after the server's
//! `Retry-After` delay (or the configured default); every other outcome is
//! forwarded as is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::envelope::{RequestEnvelope, ResponseEnvelope};
use super::fetcher::Fetcher;
use crate::config::ProcessorConfig;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::queue::keys::REQUEST_QUEUE;
use crate::queue::QueueStore;

const TOO_MANY_REQUESTS: u16 = 429;

/// Delay before polling again after a store error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Statistics about a processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProcessorStats {
    /// Requests answered with a 2xx status.
    pub succeeded: u64,
    /// Requests answered with any other HTTP status.
    pub http_errors: u64,
    /// Requests that never produced an HTTP response.
    pub failed: u64,
    /// 429 retries performed.
    pub retries: u64,
    /// Envelopes skipped because they were not valid JSON.
    pub malformed: u64,
    /// Average time from pop to push.
    pub average_latency_ms: u64,
}

impl ProcessorStats {
    /// Returns the number of requests answered.
    pub fn total_processed(&self) -> u64 {
        self.succeeded + self.http_errors + self.failed
    }
}

#[derive(Default)]
struct SharedProcessorStats {
    succeeded: AtomicU64,
    http_errors: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    malformed: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl SharedProcessorStats {
    fn record_response(&self, response: &ResponseEnvelope, latency: Duration) {
        let counter = if response.error.is_some() {
            &self.failed
        } else if (200..300).contains(&response.status) {
            &self.succeeded
        } else {
            &self.http_errors
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_processor_stats(&self) -> ProcessorStats {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let http_errors = self.http_errors.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let total = succeeded + http_errors + failed;
        let total_latency_ms = self.total_latency_ms.load(Ordering::SeqCst);

        ProcessorStats {
            succeeded,
            http_errors,
            failed,
            retries: self.retries.load(Ordering::SeqCst),
            malformed: self.malformed.load(Ordering::SeqCst),
            average_latency_ms: if total > 0 { total_latency_ms / total } else { 0 },
        }
    }
}

/// Consumer of `request_queue`.
///
/// Several processors may consume the same queue; each request is popped by
/// exactly one of them.
pub struct RequestProcessor {
    store: Arc<dyn QueueStore>,
    fetcher: Arc<dyn Fetcher>,
    config: ProcessorConfig,
    stats: Arc<SharedProcessorStats>,
    metrics: MetricsCollector,
}

impl RequestProcessor {
    /// Creates a processor.
    ///
    /// `store` should own its blocking connection.
    pub fn new(store: Arc<dyn QueueStore>, fetcher: Arc<dyn Fetcher>, config: ProcessorConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
            stats: Arc::new(SharedProcessorStats::default()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns current statistics.
    pub fn stats(&self) -> ProcessorStats {
        self.stats.to_processor_stats()
    }

    /// Pops and handles requests until a shutdown signal is received.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_timeout_secs = self.config.poll_timeout.as_secs(),
            "Request processor started"
        );

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!("Request processor received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.store.blpop(REQUEST_QUEUE, self.config.poll_timeout).await {
                Ok(Some(raw)) => {
                    self.handle_raw(&raw).await;
                }
                Ok(None) => {
                    debug!("No requests available");
                }
                Err(e) => {
                    error!(error = %e, "Failed to pop request queue");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        info!("Request processor stopped");
    }

    /// Handles one raw envelope as popped from the queue.
    ///
    /// Malformed envelopes are logged and skipped: there is no response
    /// queue to report them to.
    pub async fn handle_raw(&self, raw: &str) {
        let request: RequestEnvelope = match serde_json::from_str(raw) {
            Ok(request) => request,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::SeqCst);
                warn!(error = %e, "Skipping malformed request envelope");
                return;
            }
        };

        if let Err(e) = self.process(&request).await {
            error!(
                request_id = %request.id,
                response_queue = %request.response_queue,
                error = %e,
                "Failed to push response"
            );
        }
    }

    /// Executes `request` and pushes its response envelope.
    pub async fn process(&self, request: &RequestEnvelope) -> Result<(), QueueError> {
        let started = Instant::now();
        let response = self.execute(request).await;
        let latency = started.elapsed();

        self.stats.record_response(&response, latency);
        self.metrics
            .record_processor_response(response.status, latency.as_secs_f64());
        info!(
            request_id = %request.id,
            source = %request.source,
            url = %request.url,
            status = response.status,
            duration_ms = latency.as_millis() as u64,
            "Request processed"
        );

        let serialized = serde_json::to_string(&response)?;
        self.store.lpush(&request.response_queue, serialized).await
    }

    /// Performs the HTTP call, retrying 429 responses.
    ///
    /// The retry table bounds the number of retries; when it runs out the
    /// last 429 is returned like any other status.
    pub async fn execute(&self, request: &RequestEnvelope) -> ResponseEnvelope {
        let mut delays = self.config.retry_delays.iter();

        loop {
            let response = match self.fetcher.fetch(request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(request_id = %request.id, url = %request.url, error = %e, "Request failed");
                    return ResponseEnvelope::failure(&request.id, e.status(), e.to_string());
                }
            };

            if response.status != TOO_MANY_REQUESTS {
                return ResponseEnvelope::from_http(&request.id, response);
            }

            let Some(default_delay) = delays.next() else {
                warn!(request_id = %request.id, url = %request.url, "Retries exhausted on 429");
                return ResponseEnvelope::from_http(&request.id, response);
            };

            let delay = response.retry_after.unwrap_or(*default_delay);
            self.stats.retries.fetch_add(1, Ordering::SeqCst);
            self.metrics.record_retry();
            warn!(
                request_id = %request.id,
                url = %request.url,
                delay_ms = delay.as_millis() as u64,
                "Rate limited by upstream, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
