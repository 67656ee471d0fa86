//! Job enqueuer for the Sidekiq-compatible worker runtime.
//!
//! Daemons hand normalized payloads to [`JobDispatcher`], which wraps them in
//! a [`JobEnvelope`] and writes them where the worker runtime looks:
//!
//! - immediate jobs: `RPUSH queue:<name>` then `SADD queues <name>`;
//! - delayed jobs (payload carries `at`): `ZADD schedule <at> <envelope>`,
//!   leaving promotion to the runtime's scheduler.
//!
//! The two writes of an immediate job are independent. A crash between them
//! can leave a registered queue without jobs or jobs in an unregistered
//! queue; discovery through `queues` is advisory.

pub mod envelope;
pub mod jobs;

use std::sync::Arc;

use tracing::debug;

use crate::error::DispatchError;
use crate::metrics::MetricsCollector;
use crate::queue::keys::{job_queue_key, QUEUES_SET, SCHEDULE_SET};
use crate::queue::QueueStore;

pub use envelope::{new_jid, snake_case_queue, JobEnvelope};
pub use jobs::{
    BlockProposalJob, CoinPriceJob, EpochHistoryJob, JobPayload, LedgerInfoJob, StakeRewardJob,
    ValidatorPerformanceJob, ValidatorSnapshotJob, ValidatorStatus, ValidatorVoteJob,
};

/// Queue used when a payload names none.
pub const DEFAULT_QUEUE: &str = "default";

/// Writes job envelopes to the worker runtime's queues.
#[derive(Clone)]
pub struct JobDispatcher {
    store: Arc<dyn QueueStore>,
    metrics: MetricsCollector,
}

impl JobDispatcher {
    /// Creates a dispatcher writing to `store`.
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            metrics: MetricsCollector::new(),
        }
    }

    /// Enqueues `payload` for `worker_class`.
    ///
    /// The queue is taken from `payload.queue` (snake-cased), falling back
    /// to `default`. A numeric `payload.at` schedules the job instead.
    ///
    /// # Returns
    ///
    /// The job id of the written envelope.
    pub async fn enqueue(
        &self,
        worker_class: &str,
        payload: serde_json::Value,
    ) -> Result<String, DispatchError> {
        let queue = payload
            .get("queue")
            .and_then(|q| q.as_str())
            .map(snake_case_queue)
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        self.enqueue_to(worker_class, &queue, payload).await
    }

    /// Enqueues a typed job on the queue its kind is routed to.
    pub async fn dispatch(&self, job: &JobPayload) -> Result<String, DispatchError> {
        let payload = serde_json::to_value(job)?;
        self.enqueue_to(job.worker_class(), job.queue(), payload)
            .await
    }

    /// Enqueues `payload` on an explicit queue.
    pub async fn enqueue_to(
        &self,
        worker_class: &str,
        queue: &str,
        payload: serde_json::Value,
    ) -> Result<String, DispatchError> {
        if worker_class.trim().is_empty() {
            return Err(DispatchError::EmptyWorkerClass);
        }
        let queue = snake_case_queue(queue);

        if let Some(at) = payload.get("at").and_then(|a| a.as_f64()) {
            if !at.is_finite() || at < 0.0 {
                return Err(DispatchError::InvalidScheduleTime(at));
            }
            let envelope = JobEnvelope::scheduled(worker_class, &queue, payload, at);
            let serialized = serde_json::to_string(&envelope)?;
            self.store.zadd(SCHEDULE_SET, at, serialized).await?;

            debug!(class = worker_class, jid = %envelope.jid, at = at, "Scheduled job");
            self.metrics.record_job_enqueued(&queue, true);
            return Ok(envelope.jid);
        }

        let envelope = JobEnvelope::immediate(worker_class, &queue, payload);
        let serialized = serde_json::to_string(&envelope)?;
        self.store.rpush(&job_queue_key(&queue), serialized).await?;
        self.store.sadd(QUEUES_SET, &queue).await?;

        debug!(class = worker_class, jid = %envelope.jid, queue = %queue, "Enqueued job");
        self.metrics.record_job_enqueued(&queue, false);
        Ok(envelope.jid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryStore;
    use serde_json::json;

    fn dispatcher() -> (Arc<MemoryStore>, JobDispatcher) {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = JobDispatcher::new(store.clone());
        (store, dispatcher)
    }

    #[tokio::test]
    async fn test_enqueue_defaults_queue_and_registers_it() {
        let (store, dispatcher) = dispatcher();
        let jid = dispatcher
            .enqueue("LedgerInfoJob", json!({"epoch": 12}))
            .await
            .unwrap();

        let stored = store.lrange("queue:default", 0, -1).await.unwrap();
        assert_eq!(stored.len(), 1);
        let envelope: JobEnvelope = serde_json::from_str(&stored[0]).unwrap();
        assert_eq!(envelope.jid, jid);
        assert_eq!(envelope.class, "LedgerInfoJob");
        assert_eq!(envelope.queue, "default");
        assert_eq!(envelope.payload(), Some(&json!({"epoch": 12})));

        assert_eq!(store.smembers(QUEUES_SET).await.unwrap(), vec!["default"]);
    }

    #[tokio::test]
    async fn test_enqueue_snake_cases_payload_queue() {
        let (store, dispatcher) = dispatcher();
        dispatcher
            .enqueue("ValidatorSnapshotJob", json!({"queue": "ValidatorUpdates"}))
            .await
            .unwrap();

        assert_eq!(store.llen("queue:validator_updates").await.unwrap(), 1);
        assert_eq!(
            store.smembers(QUEUES_SET).await.unwrap(),
            vec!["validator_updates"]
        );
    }

    #[tokio::test]
    async fn test_scheduled_job_goes_to_schedule_only() {
        let (store, dispatcher) = dispatcher();
        let at = 4_102_444_800.0;
        let payload = json!({"at": at, "coin": "aptos"});
        dispatcher.enqueue("CoinPriceJob", payload.clone()).await.unwrap();

        let entries = store.sorted_set_entries(SCHEDULE_SET);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, at);
        let envelope: JobEnvelope = serde_json::from_str(&entries[0].1).unwrap();
        assert_eq!(envelope.at, Some(at));
        assert_eq!(envelope.payload(), Some(&payload));

        assert!(store.smembers(QUEUES_SET).await.unwrap().is_empty());
        assert_eq!(store.llen("queue:default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_class_args_and_queue() {
        let (store, dispatcher) = dispatcher();
        let payloads = [
            ("StakeRewardJob", "rewards", json!({"pool_address": "0x1", "rewards_amount": 5})),
            ("BlockProposalJob", "blocks", json!({"height": 100, "proposer": "0xabc"})),
            ("CoinPriceJob", "prices", json!({"price": 8.25})),
        ];

        for (class, queue, payload) in &payloads {
            dispatcher
                .enqueue_to(class, queue, payload.clone())
                .await
                .unwrap();
            let raw = store.lrange(&job_queue_key(queue), -1, -1).await.unwrap();
            let envelope: JobEnvelope = serde_json::from_str(&raw[0]).unwrap();
            assert_eq!(envelope.class, *class);
            assert_eq!(envelope.queue, *queue);
            assert_eq!(envelope.args[0], *payload);
        }
    }

    #[tokio::test]
    async fn test_dispatch_typed_job() {
        let (store, dispatcher) = dispatcher();
        let job = JobPayload::CoinPrice(CoinPriceJob {
            coin: "aptos".to_string(),
            currency: "usd".to_string(),
            price: 8.5,
            observed_at: 1_700_000_000,
        });
        dispatcher.dispatch(&job).await.unwrap();

        let raw = store.lrange("queue:prices", 0, -1).await.unwrap();
        let envelope: JobEnvelope = serde_json::from_str(&raw[0]).unwrap();
        assert_eq!(envelope.class, "CoinPriceJob");
        assert_eq!(envelope.args[0]["price"], 8.5);
    }

    #[tokio::test]
    async fn test_rejects_empty_class_and_bad_schedule() {
        let (_, dispatcher) = dispatcher();
        assert!(matches!(
            dispatcher.enqueue(" ", json!({})).await,
            Err(DispatchError::EmptyWorkerClass)
        ));
        assert!(matches!(
            dispatcher.enqueue("X", json!({"at": -5.0})).await,
            Err(DispatchError::InvalidScheduleTime(_))
        ));
    }
}
