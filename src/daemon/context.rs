//! Services available to a daemon during a poll cycle.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::broker::{
    FetchedResponse, RequestEnvelope, RequestManager, RequestOptions, ResponseRouter,
};
use crate::config::{AppConfig, AptosNetwork, DaemonConfig};
use crate::dispatcher::{JobDispatcher, JobPayload};
use crate::error::{BrokerError, DaemonError, LimitKind, QueueError, RequestError};
use crate::queue::keys::REQUEST_QUEUE;
use crate::queue::QueueStore;

/// Broker rejections retried before a fetch fails.
const RATE_LIMIT_RETRIES: u32 = 3;
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

/// How a daemon's HTTP requests reach the processor.
#[derive(Clone)]
pub enum Transport {
    /// Push envelopes straight onto `request_queue` and consume the
    /// daemon's own response queue.
    Queue,
    /// Submit through an in-process broker, sharing its rate limits and
    /// deduplication with every other daemon using it.
    Broker(Arc<RequestManager>),
}

/// Per-daemon context handed to [`Daemon::run`](super::Daemon::run).
pub struct DaemonContext {
    name: &'static str,
    store: Arc<dyn QueueStore>,
    dispatcher: JobDispatcher,
    router: Arc<ResponseRouter>,
    transport: Transport,
    config: DaemonConfig,
    app: AppConfig,
}

impl DaemonContext {
    /// Creates a context for the daemon called `name`.
    ///
    /// Responses for `name` are expected on `response_queue:<name>`.
    pub fn new(
        name: &'static str,
        store: Arc<dyn QueueStore>,
        app: AppConfig,
        config: DaemonConfig,
        transport: Transport,
    ) -> Self {
        Self {
            name,
            dispatcher: JobDispatcher::new(Arc::clone(&store)),
            router: Arc::new(ResponseRouter::new(name)),
            store,
            transport,
            config,
            app,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    pub fn router(&self) -> &Arc<ResponseRouter> {
        &self.router
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn app(&self) -> &AppConfig {
        &self.app
    }

    pub fn network(&self) -> &AptosNetwork {
        &self.app.network
    }

    /// Full URL of `path` on the configured fullnode.
    pub fn node_url(&self, path: &str) -> String {
        let base = self.app.network.base_url().trim_end_matches('/');
        if path.is_empty() || path == "/" {
            format!("{}/", base)
        } else {
            format!("{}/{}", base, path.trim_start_matches('/'))
        }
    }

    /// Pushes a GET for `url` onto `request_queue` and waits for the
    /// processor's answer on this daemon's response queue.
    ///
    /// The response listener must be running, otherwise the request times
    /// out after the configured request timeout.
    pub async fn fetch_with_queue(&self, url: &str) -> Result<FetchedResponse, DaemonError> {
        let envelope = RequestEnvelope::new(
            url,
            RequestOptions::json_get(),
            self.name,
            self.router.response_queue(),
        );
        let rx = self.router.register(&envelope.id);

        let pushed = match serde_json::to_string(&envelope) {
            Ok(serialized) => self.store.rpush(REQUEST_QUEUE, serialized).await,
            Err(e) => Err(QueueError::from(e)),
        };
        if let Err(e) = pushed {
            self.router.cancel(&envelope.id);
            return Err(RequestError::Submit(e.to_string()).into());
        }

        debug!(daemon = self.name, request_id = %envelope.id, url = url, "Request queued");
        Ok(self
            .router
            .wait(&envelope.id, rx, self.config.request_timeout)
            .await?)
    }

    /// Fetches `url` over the configured transport.
    ///
    /// A broker rejection for a full per-second window is retried after a
    /// second, a bounded number of times. A full quota window fails at once.
    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, DaemonError> {
        let manager = match &self.transport {
            Transport::Queue => return self.fetch_with_queue(url).await,
            Transport::Broker(manager) => manager,
        };

        let mut attempt = 0;
        let response = loop {
            match manager
                .submit_request(url, RequestOptions::json_get(), self.name)
                .await
            {
                Ok(response) => break response,
                Err(BrokerError::RateLimited {
                    kind: LimitKind::PerSecond,
                    ..
                }) if attempt < RATE_LIMIT_RETRIES => {
                    attempt += 1;
                    debug!(daemon = self.name, url = url, attempt, "Broker window full, waiting");
                    tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        Ok(response.await?)
    }

    /// Fetches `url` and decodes a 2xx body into `T`.
    ///
    /// # Errors
    ///
    /// - `DaemonError::UnexpectedStatus` for non-2xx responses
    /// - `DaemonError::Parse` if the body does not match `T`
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, DaemonError> {
        let response = self.fetch(url).await?;
        if !response.is_success() {
            return Err(DaemonError::UnexpectedStatus {
                url: url.to_string(),
                status: response.status,
            });
        }
        response.json().map_err(|e| DaemonError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// Enqueues a typed job.
    pub async fn dispatch(&self, job: JobPayload) -> Result<String, DaemonError> {
        Ok(self.dispatcher.dispatch(&job).await?)
    }
}
