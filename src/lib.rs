//! validator-pulse: Aptos validator analytics daemons on a Redis request broker.
//!
//! Daemons poll an Aptos fullnode and CoinGecko on fixed intervals, send
//! their HTTP traffic through a Redis-backed request/response queue pair
//! (optionally rate limited and deduplicated by the [`broker`]), and enqueue
//! Sidekiq-compatible jobs for whatever changed.

pub mod broker;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod daemons;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod queue;

// Re-export commonly used error types
pub use error::{
    BrokerError, ConfigError, DaemonError, DispatchError, FetchError, QueueError, RequestError,
};
