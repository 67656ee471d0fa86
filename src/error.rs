//! Error types for validator-pulse operations.
//!
//! Defines error types for each subsystem:
//! - Queue store access (Redis or in-memory)
//! - Job dispatch to the worker runtime
//! - Rate-limited request brokering and response correlation
//! - Raw HTTP fetching
//! - Daemon poll cycles
//! - Configuration

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the queue store.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize an envelope.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while enqueuing jobs for the worker runtime.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Worker class must not be empty")]
    EmptyWorkerClass,

    #[error("Invalid schedule time '{0}': must be a finite unix timestamp")]
    InvalidScheduleTime(f64),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which rate window rejected a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Requests per second window.
    PerSecond,
    /// Coarse quota window.
    Quota,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::PerSecond => write!(f, "requests-per-second"),
            LimitKind::Quota => write!(f, "quota"),
        }
    }
}

/// Errors returned synchronously by the request broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Rate limit exceeded ({kind}): {current}/{limit} requests in window, retry later")]
    RateLimited {
        kind: LimitKind,
        current: usize,
        limit: usize,
    },

    #[error("Failed to hand request to queue: {0}")]
    Queue(#[from] QueueError),
}

/// Outcome error of a correlated request.
///
/// Cloneable because deduplicated requests share one result between callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    /// No response arrived before the local timer fired.
    #[error("Request {request_id} timed out after {after:?}")]
    Timeout { request_id: String, after: Duration },

    /// The processor reported a failure for the request.
    #[error("Request failed with status {status}: {message}")]
    Remote { status: u16, message: String },

    /// The pending entry was dropped before a response arrived.
    #[error("Request {0} was cancelled")]
    Cancelled(String),

    /// The request envelope could not be pushed.
    #[error("Failed to submit request: {0}")]
    Submit(String),
}

/// Errors raised by a single HTTP attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl FetchError {
    /// HTTP-like status reported back to the caller for this failure.
    pub fn status(&self) -> u16 {
        match self {
            FetchError::Timeout(_) => 408,
            _ => 500,
        }
    }
}

/// Errors that can occur during a daemon poll cycle.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Request failed: {0}")]
    Request(#[from] RequestError),

    #[error("Broker rejected request: {0}")]
    Broker(#[from] BrokerError),

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },

    #[error("Failed to parse response from {url}: {message}")]
    Parse { url: String, message: String },

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Unknown daemon '{0}'")]
    UnknownDaemon(String),

    #[error("Daemon is already running")]
    AlreadyRunning,

    #[error("Daemon is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Daemon task failed: {0}")]
    TaskFailed(String),
}

/// Errors that can occur while building configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown network '{0}': expected mainnet, testnet, devnet or an http(s) URL")]
    UnknownNetwork(String),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}
