//! Sliding-window rate limiting for the request broker.
//!
//! State is process-local: two brokers do not share their windows.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::BrokerConfig;
use crate::error::LimitKind;

/// Timestamps of recent requests inside a trailing window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Creates a window admitting `limit` requests per `window`.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    /// Drops timestamps that fell out of the window ending at `now`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.hits.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns whether another request fits in the window ending at `now`.
    pub fn has_capacity(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.hits.len() < self.limit
    }

    /// Records a request at `now`.
    pub fn record(&mut self, now: Instant) {
        self.hits.push_back(now);
    }

    /// Requests currently counted.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Returns whether the window holds no requests.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Maximum requests per window.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Per-second window plus a coarse quota window.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    per_second: SlidingWindow,
    quota: SlidingWindow,
}

impl RateLimiter {
    /// Creates a limiter from broker settings.
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            per_second: SlidingWindow::new(config.max_requests_per_second, Duration::from_secs(1)),
            quota: SlidingWindow::new(config.max_requests_per_quota_window, config.quota_window),
        }
    }

    /// Returns false when the trailing second is full.
    pub fn check_rps_limit(&mut self) -> bool {
        self.per_second.has_capacity(Instant::now())
    }

    /// Returns false when the quota window is full.
    pub fn check_quota_limit(&mut self) -> bool {
        self.quota.has_capacity(Instant::now())
    }

    /// Checks both windows and records the request when it fits.
    ///
    /// # Errors
    ///
    /// Returns the exhausted window with its count and limit; nothing is
    /// recorded in that case.
    pub fn try_acquire(&mut self) -> Result<(), (LimitKind, usize, usize)> {
        if !self.check_rps_limit() {
            return Err((LimitKind::PerSecond, self.per_second.len(), self.per_second.limit()));
        }
        if !self.check_quota_limit() {
            return Err((LimitKind::Quota, self.quota.len(), self.quota.limit()));
        }
        let now = Instant::now();
        self.per_second.record(now);
        self.quota.record(now);
        Ok(())
    }

    /// Drops expired timestamps from both windows.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.per_second.prune(now);
        self.quota.prune(now);
    }

    /// Requests counted in the trailing second.
    pub fn current_rps(&self) -> usize {
        self.per_second.len()
    }

    /// Requests counted in the quota window.
    pub fn current_quota(&self) -> usize {
        self.quota.len()
    }
}
