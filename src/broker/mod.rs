//! Request broker and processor.
//!
//! Outbound HTTP traffic flows through a pair of Redis lists:
//!
//! ```text
//! daemon ──submit──▶ RequestManager ──RPUSH──▶ request_queue
//!                                                  │ BLPOP
//!                                                  ▼
//!                                           RequestProcessor ──HTTP──▶ API
//!                                                  │ LPUSH
//!                                                  ▼
//! daemon ◀──settle── ResponseRouter ◀──BRPOP── response_queue:<owner>
//! ```
//!
//! The manager enforces rate limits and deduplication before anything is
//! queued. Daemons may also push envelopes directly and consume their own
//! response queue through a [`ResponseRouter`].

pub mod correlation;
pub mod envelope;
pub mod fetcher;
pub mod manager;
pub mod processor;
pub mod rate_limit;

pub use correlation::{RequestOutcome, ResponseRouter};
pub use envelope::{FetchedResponse, RequestEnvelope, RequestOptions, ResponseEnvelope};
pub use fetcher::{Fetcher, HttpResponse, ReqwestFetcher};
pub use manager::{BrokerStats, RequestManager, SharedResponse};
pub use processor::{ProcessorStats, RequestProcessor};
pub use rate_limit::{RateLimiter, SlidingWindow};
