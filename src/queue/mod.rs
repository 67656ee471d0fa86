//! Redis-backed queues shared by daemons, the broker and the processor.
//!
//! - **keys**: key naming shared with the worker runtime and dashboard
//! - **QueueStore**: the atomic single-key commands the system uses
//! - **RedisStore**: production store over `redis::aio::ConnectionManager`
//! - **MemoryStore**: in-process store with the same semantics
//!
//! # Layout
//!
//! ```text
//!  queue:<name>              list   job envelopes (RPUSH / worker LPOP)
//!  queues                    set    known queue names
//!  schedule                  zset   delayed job envelopes by unix seconds
//!  request_queue             list   HTTP request envelopes (RPUSH / BLPOP)
//!  response_queue:<Owner>    list   response envelopes (LPUSH / BRPOP)
//!  request_manager:monitoring string broker stats snapshot
//!  request_manager:logs      pubsub broker log lines
//! ```

pub mod keys;
pub mod memory;
pub mod store;

pub use memory::MemoryStore;
pub use store::{QueueStore, RedisStore};
