//! Correlation of response envelopes with pending requests.
//!
//! A [`ResponseRouter`] owns the map from request id to a one-shot channel.
//! Submitting a request registers an entry; the listener loop pops the
//! owner's response queue and settles the matching entry. Responses whose
//! id is unknown (late, duplicated, or addressed to a timed-out request)
//! are dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::envelope::{FetchedResponse, ResponseEnvelope};
use crate::error::RequestError;
use crate::queue::keys::response_queue_key;
use crate::queue::QueueStore;

/// Delay before polling again after a store error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome delivered to a waiting requester.
pub type RequestOutcome = Result<FetchedResponse, RequestError>;

struct Pending {
    settle: oneshot::Sender<RequestOutcome>,
    registered_at: Instant,
}

/// Pending-request map of one response-queue owner.
pub struct ResponseRouter {
    owner: String,
    pending: Mutex<HashMap<String, Pending>>,
}

impl ResponseRouter {
    /// Creates a router for responses addressed to `owner`.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Name whose response queue this router consumes.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Key of the response queue this router consumes.
    pub fn response_queue(&self) -> String {
        response_queue_key(&self.owner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `request_id` and returns the receiving half of its channel.
    ///
    /// Registering an id twice replaces the earlier entry, whose receiver
    /// then observes cancellation.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<RequestOutcome> {
        let (settle, rx) = oneshot::channel();
        self.lock().insert(
            request_id.to_string(),
            Pending {
                settle,
                registered_at: Instant::now(),
            },
        );
        rx
    }

    /// Removes `request_id` without settling it.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.lock().remove(request_id).is_some()
    }

    /// Settles the entry matching `envelope.request_id`.
    ///
    /// # Returns
    ///
    /// `false` when no entry matched and the response was dropped.
    pub fn deliver(&self, envelope: ResponseEnvelope) -> bool {
        let Some(pending) = self.lock().remove(&envelope.request_id) else {
            debug!(
                owner = %self.owner,
                request_id = %envelope.request_id,
                "Dropping unmatched response"
            );
            return false;
        };
        // The receiver may have given up already.
        let _ = pending.settle.send(envelope.into_result());
        true
    }

    /// Times out every entry registered more than `max_age` ago.
    ///
    /// # Returns
    ///
    /// The number of expired entries.
    pub fn expire(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Pending)> = {
            let mut pending = self.lock();
            let stale: Vec<String> = pending
                .iter()
                .filter(|(_, p)| now.saturating_duration_since(p.registered_at) >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let count = expired.len();
        for (request_id, pending) in expired {
            let _ = pending.settle.send(Err(RequestError::Timeout {
                request_id,
                after: max_age,
            }));
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Waits for the outcome of a registered request.
    ///
    /// On timeout the entry is removed, so a late response is dropped.
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<RequestOutcome>,
        timeout: Duration,
    ) -> RequestOutcome {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::Cancelled(request_id.to_string())),
            Err(_) => {
                self.cancel(request_id);
                Err(RequestError::Timeout {
                    request_id: request_id.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Consumes the response queue until a shutdown signal arrives.
    ///
    /// Each pop blocks for at most `poll_timeout`, which bounds how long a
    /// shutdown takes to be noticed. Store errors are logged and retried.
    pub async fn listen(
        &self,
        store: &dyn QueueStore,
        poll_timeout: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let key = self.response_queue();
        info!(owner = %self.owner, queue = %key, "Response listener started");

        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match store.brpop(&key, poll_timeout).await {
                Ok(Some(raw)) => match serde_json::from_str::<ResponseEnvelope>(&raw) {
                    Ok(envelope) => {
                        self.deliver(envelope);
                    }
                    Err(e) => {
                        warn!(owner = %self.owner, error = %e, "Skipping malformed response envelope");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    error!(owner = %self.owner, error = %e, "Failed to pop response queue");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }

        info!(owner = %self.owner, "Response listener stopped");
    }
}
