//! Rate-limited request broker.
//!
//! [`RequestManager`] accepts "fetch this URL" requests from daemons running
//! in the same process. It enforces the per-second and quota windows,
//! collapses identical URLs submitted within the dedup window onto one
//! in-flight request, and hands accepted requests to `request_queue` for a
//! processor. Responses come back on `response_queue:RequestManager`.
//!
//! Submission never waits for capacity: a full window is reported to the
//! caller immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::correlation::{RequestOutcome, ResponseRouter};
use super::envelope::{RequestEnvelope, RequestOptions};
use super::rate_limit::RateLimiter;
use crate::config::{AppConfig, BrokerConfig};
use crate::error::{BrokerError, RequestError};
use crate::metrics::{MetricsCollector, SubmitOutcome};
use crate::queue::keys::{response_queue_key, BROKER_SOURCE, LOGS_CHANNEL, MONITORING_KEY, REQUEST_QUEUE};
use crate::queue::QueueStore;

/// Result handle shared by every caller of a deduplicated request.
pub type SharedResponse = Shared<BoxFuture<'static, RequestOutcome>>;

struct InFlight {
    response: SharedResponse,
    submitted_at: Instant,
    caller: String,
}

/// Snapshot persisted to `request_manager:monitoring` for the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerStats {
    pub submitted: u64,
    pub duplicate_requests: u64,
    pub rate_limited: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub pending: usize,
    pub current_rps: usize,
    pub max_rps: usize,
    pub current_quota: usize,
    pub max_quota: usize,
    pub in_flight_urls: usize,
    pub uptime_secs: u64,
    pub environment: String,
    pub git_hash: Option<String>,
    pub updated_at: String,
}

/// Counters updated from submission and from settled futures.
#[derive(Default)]
struct SharedBrokerStats {
    submitted: AtomicU64,
    duplicate_requests: AtomicU64,
    rate_limited: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl SharedBrokerStats {
    fn record_outcome(&self, outcome: &RequestOutcome) {
        let counter = match outcome {
            Ok(_) => &self.completed,
            Err(RequestError::Timeout { .. }) => &self.timed_out,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Rate-limited, deduplicating request broker.
pub struct RequestManager {
    config: BrokerConfig,
    store: Arc<dyn QueueStore>,
    router: Arc<ResponseRouter>,
    limiter: Mutex<RateLimiter>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    stats: Arc<SharedBrokerStats>,
    started_at: Instant,
    environment: String,
    git_hash: Option<String>,
    metrics: MetricsCollector,
}

impl RequestManager {
    /// Creates a broker writing to `store`.
    ///
    /// `store` should own its blocking connection: the response listener
    /// started by [`RequestManager::run`] blocks on it.
    pub fn new(config: BrokerConfig, store: Arc<dyn QueueStore>, app: &AppConfig) -> Self {
        Self {
            limiter: Mutex::new(RateLimiter::new(&config)),
            config,
            store,
            router: Arc::new(ResponseRouter::new(BROKER_SOURCE)),
            in_flight: Mutex::new(HashMap::new()),
            stats: Arc::new(SharedBrokerStats::default()),
            started_at: Instant::now(),
            environment: app.environment.clone(),
            git_hash: app.git_hash.clone(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Router settling this broker's requests.
    pub fn router(&self) -> &Arc<ResponseRouter> {
        &self.router
    }

    /// Submits a request for `url` on behalf of `caller`.
    ///
    /// An identical URL submitted within the dedup window returns the
    /// existing handle, so both callers observe the same outcome.
    ///
    /// # Errors
    ///
    /// - `BrokerError::RateLimited` if either window is full; retry later.
    /// - `BrokerError::Queue` if the request could not be pushed.
    pub async fn submit_request(
        &self,
        url: &str,
        options: RequestOptions,
        caller: &str,
    ) -> Result<SharedResponse, BrokerError> {
        let admitted = {
            let now = Instant::now();
            let mut in_flight = self.lock_in_flight();
            let window = self.config.dedup_window;
            in_flight.retain(|_, entry| now.saturating_duration_since(entry.submitted_at) < window);

            if let Some(entry) = in_flight.get(url) {
                self.stats.duplicate_requests.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_submission(SubmitOutcome::Duplicate);
                debug!(
                    url = url,
                    caller = caller,
                    first_caller = %entry.caller,
                    "Serving duplicate request from in-flight entry"
                );
                return Ok(entry.response.clone());
            }

            let acquired = self.lock_limiter().try_acquire();
            acquired.map(|()| {
                let envelope = RequestEnvelope::new(
                    url,
                    options,
                    caller,
                    response_queue_key(BROKER_SOURCE),
                );
                let response = self.track(&envelope.id);
                in_flight.insert(
                    url.to_string(),
                    InFlight {
                        response: response.clone(),
                        submitted_at: now,
                        caller: caller.to_string(),
                    },
                );
                (envelope, response)
            })
        };

        let (envelope, response) = match admitted {
            Ok(admitted) => admitted,
            Err((kind, current, limit)) => {
                self.stats.rate_limited.fetch_add(1, Ordering::SeqCst);
                self.metrics.record_submission(SubmitOutcome::RateLimited);
                warn!(url = url, caller = caller, limit_kind = %kind, current, limit, "Rate limit exceeded");
                self.publish_log(format!(
                    "rate limit exceeded ({}): {}/{} from {} for {}",
                    kind, current, limit, caller, url
                ))
                .await;
                return Err(BrokerError::RateLimited {
                    kind,
                    current,
                    limit,
                });
            }
        };

        let serialized = serde_json::to_string(&envelope).map_err(crate::error::QueueError::from);
        let pushed = match serialized {
            Ok(serialized) => self.store.rpush(REQUEST_QUEUE, serialized).await,
            Err(e) => Err(e),
        };
        if let Err(e) = pushed {
            self.lock_in_flight().remove(url);
            self.router.cancel(&envelope.id);
            return Err(e.into());
        }

        self.stats.submitted.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_submission(SubmitOutcome::Accepted);
        debug!(request_id = %envelope.id, url = url, caller = caller, "Request submitted");
        Ok(response)
    }

    /// Registers `request_id` and builds its shared, self-timing handle.
    ///
    /// The wait runs on its own task, so the outcome is counted even when
    /// every caller dropped its handle.
    fn track(&self, request_id: &str) -> SharedResponse {
        let rx = self.router.register(request_id);
        let router = Arc::clone(&self.router);
        let stats = Arc::clone(&self.stats);
        let id = request_id.to_string();
        let timeout = self.config.request_timeout;

        let waiter = tokio::spawn(async move {
            let outcome = router.wait(&id, rx, timeout).await;
            stats.record_outcome(&outcome);
            outcome
        });

        let request_id = request_id.to_string();
        async move {
            match waiter.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Response waiter failed");
                    Err(RequestError::Cancelled(request_id))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Runs the response listener and the stats tick until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let listener = {
            let manager = Arc::clone(&self);
            let shutdown = shutdown.resubscribe();
            tokio::spawn(async move {
                manager
                    .router
                    .listen(
                        manager.store.as_ref(),
                        manager.config.response_poll_timeout,
                        shutdown,
                    )
                    .await
            })
        };

        info!(
            max_rps = self.config.max_requests_per_second,
            max_quota = self.config.max_requests_per_quota_window,
            "Request manager started"
        );

        let mut ticker = tokio::time::interval(self.config.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.recv() => break,
            }
        }

        if let Err(e) = listener.await {
            warn!(error = %e, "Response listener task failed");
        }
        info!("Request manager stopped");
    }

    /// Prunes expired state and persists a stats snapshot.
    pub async fn tick(&self) {
        self.lock_limiter().prune();

        let now = Instant::now();
        let window = self.config.dedup_window;
        self.lock_in_flight()
            .retain(|_, entry| now.saturating_duration_since(entry.submitted_at) < window);

        let expired = self.router.expire(self.config.request_timeout);
        if expired > 0 {
            self.publish_log(format!("{} request(s) timed out", expired)).await;
        }

        let stats = self.stats();
        self.metrics.set_pending_requests(stats.pending);
        match serde_json::to_string(&stats) {
            Ok(json) => {
                if let Err(e) = self.store.set(MONITORING_KEY, json).await {
                    warn!(error = %e, "Failed to persist monitoring snapshot");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize monitoring snapshot"),
        }
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> BrokerStats {
        let (current_rps, current_quota) = {
            let limiter = self.lock_limiter();
            (limiter.current_rps(), limiter.current_quota())
        };

        BrokerStats {
            submitted: self.stats.submitted.load(Ordering::SeqCst),
            duplicate_requests: self.stats.duplicate_requests.load(Ordering::SeqCst),
            rate_limited: self.stats.rate_limited.load(Ordering::SeqCst),
            completed: self.stats.completed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            timed_out: self.stats.timed_out.load(Ordering::SeqCst),
            pending: self.router.pending_count(),
            current_rps,
            max_rps: self.config.max_requests_per_second,
            current_quota,
            max_quota: self.config.max_requests_per_quota_window,
            in_flight_urls: self.lock_in_flight().len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            environment: self.environment.clone(),
            git_hash: self.git_hash.clone(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    /// Publishes a log line for dashboard followers. Best effort.
    async fn publish_log(&self, line: String) {
        let message = format!("[{}] {}", Utc::now().to_rfc3339(), line);
        if let Err(e) = self.store.publish(LOGS_CHANNEL, message).await {
            debug!(error = %e, "Failed to publish broker log line");
        }
    }

    fn lock_limiter(&self) -> std::sync::MutexGuard<'_, RateLimiter> {
        self.limiter.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::envelope::ResponseEnvelope;
    use crate::broker::fetcher::HttpResponse;
    use crate::error::LimitKind;
    use crate::queue::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn manager(config: BrokerConfig) -> (Arc<MemoryStore>, Arc<RequestManager>) {
        let store = Arc::new(MemoryStore::new());
        let app = AppConfig::default().with_git_hash("deadbeef");
        let manager = Arc::new(RequestManager::new(config, store.clone(), &app));
        (store, manager)
    }

    async fn queued_requests(store: &MemoryStore) -> Vec<RequestEnvelope> {
        store
            .lrange(REQUEST_QUEUE, 0, -1)
            .await
            .unwrap()
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_url_shares_one_request() {
        let (store, manager) = manager(BrokerConfig::default());
        let url = "https://fullnode.mainnet.aptoslabs.com/v1";

        let first = manager
            .submit_request(url, RequestOptions::json_get(), "LedgerInfoDaemon")
            .await
            .unwrap();
        let second = manager
            .submit_request(url, RequestOptions::json_get(), "EpochHistoryDaemon")
            .await
            .unwrap();
        let third = manager
            .submit_request(url, RequestOptions::json_get(), "ValidatorsDaemon")
            .await
            .unwrap();

        let queued = queued_requests(&store).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].source, "LedgerInfoDaemon");
        assert_eq!(queued[0].response_queue, "response_queue:RequestManager");
        assert_eq!(manager.stats().duplicate_requests, 2);
        assert_eq!(manager.stats().submitted, 1);

        manager.router().deliver(ResponseEnvelope::from_http(
            queued[0].id.clone(),
            HttpResponse::new(200, r#"{"epoch":"9"}"#),
        ));

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        let c = third.await.unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.data, json!({"epoch": "9"}));
        assert_eq!(manager.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_entry_expires_after_window() {
        let (store, manager) = manager(BrokerConfig::default());
        let url = "https://example.com/a";

        let _first = manager
            .submit_request(url, RequestOptions::default(), "A")
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let _second = manager
            .submit_request(url, RequestOptions::default(), "A")
            .await
            .unwrap();

        assert_eq!(queued_requests(&store).await.len(), 2);
        assert_eq!(manager.stats().duplicate_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ninth_request_in_one_second_is_rejected() {
        let (store, manager) = manager(BrokerConfig::default());

        for i in 0..8 {
            manager
                .submit_request(&format!("https://example.com/{}", i), RequestOptions::default(), "A")
                .await
                .unwrap();
        }
        let err = manager
            .submit_request("https://example.com/8", RequestOptions::default(), "A")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BrokerError::RateLimited {
                kind: LimitKind::PerSecond,
                current: 8,
                limit: 8
            }
        ));
        assert_eq!(queued_requests(&store).await.len(), 8);
        assert_eq!(manager.stats().rate_limited, 1);
        assert_eq!(store.published(LOGS_CHANNEL).len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(manager
            .submit_request("https://example.com/8", RequestOptions::default(), "A")
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_is_served_even_when_window_is_full() {
        let (_, manager) =
            manager(BrokerConfig::default().with_max_requests_per_second(1));

        manager
            .submit_request("https://example.com/x", RequestOptions::default(), "A")
            .await
            .unwrap();
        assert!(manager
            .submit_request("https://example.com/x", RequestOptions::default(), "B")
            .await
            .is_ok());
        assert!(manager
            .submit_request("https://example.com/y", RequestOptions::default(), "B")
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_and_late_response_is_dropped() {
        let (store, manager) = manager(BrokerConfig::default());
        let response = manager
            .submit_request("https://example.com/slow", RequestOptions::default(), "A")
            .await
            .unwrap();

        let started = Instant::now();
        let outcome = response.await;
        assert!(matches!(outcome, Err(RequestError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(manager.stats().pending, 0);
        assert_eq!(manager.stats().timed_out, 1);

        let id = queued_requests(&store).await[0].id.clone();
        assert!(!manager
            .router()
            .deliver(ResponseEnvelope::failure(id, 500, "late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_counted_when_every_caller_dropped() {
        let (store, manager) = manager(BrokerConfig::default());
        let handle = manager
            .submit_request("https://example.com/a", RequestOptions::default(), "A")
            .await
            .unwrap();
        drop(handle);

        let id = queued_requests(&store).await[0].id.clone();
        assert!(manager.router().deliver(ResponseEnvelope::from_http(
            id,
            HttpResponse::new(200, "{}"),
        )));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.stats().completed, 1);

        drop(
            manager
                .submit_request("https://example.com/b", RequestOptions::default(), "A")
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.stats().timed_out, 1);
        assert_eq!(manager.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_persists_monitoring_snapshot() {
        let (store, manager) = manager(BrokerConfig::default());
        manager
            .submit_request("https://example.com/a", RequestOptions::default(), "A")
            .await
            .unwrap();

        manager.tick().await;

        let raw = store.get(MONITORING_KEY).await.unwrap().unwrap();
        let snapshot: BrokerStats = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot.submitted, 1);
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.current_rps, 1);
        assert_eq!(snapshot.max_rps, 8);
        assert_eq!(snapshot.git_hash.as_deref(), Some("deadbeef"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_routes_responses_from_queue() {
        let (store, manager) = manager(BrokerConfig::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&manager).run(shutdown_rx));

        let response = manager
            .submit_request("https://example.com/a", RequestOptions::default(), "A")
            .await
            .unwrap();
        let id = queued_requests(&store).await[0].id.clone();
        let reply = ResponseEnvelope::from_http(id, HttpResponse::new(404, "nope"));
        store
            .lpush(
                "response_queue:RequestManager",
                serde_json::to_string(&reply).unwrap(),
            )
            .await
            .unwrap();

        let outcome = response.await.unwrap();
        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.body.as_deref(), Some("nope"));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
