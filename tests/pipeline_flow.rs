//! End-to-end flow over the in-memory store: a daemon cycle submits a
//! request, the processor performs it against a stubbed fetcher, and the
//! resulting job lands on the worker queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use validator_pulse::broker::{
    Fetcher, HttpResponse, RequestEnvelope, RequestManager, RequestProcessor,
};
use validator_pulse::config::{AppConfig, BrokerConfig, DaemonConfig, ProcessorConfig};
use validator_pulse::daemon::{DaemonContext, DaemonRunner, Transport};
use validator_pulse::daemons::{CoinGeckoPriceDaemon, LedgerInfoDaemon};
use validator_pulse::dispatcher::JobEnvelope;
use validator_pulse::error::{DaemonError, FetchError};
use validator_pulse::queue::keys::{job_queue_key, QUEUES_SET};
use validator_pulse::queue::{MemoryStore, QueueStore};

const LEDGER: &str = r#"{"chain_id":1,"epoch":"812","ledger_version":"1500000","ledger_timestamp":"1718000000000000","block_height":"420000","node_role":"full_node"}"#;

/// Answers every request with a fixed status and body.
struct StaticFetcher {
    status: u16,
    body: &'static str,
    urls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    fn new(status: u16, body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            status,
            body,
            urls: Mutex::new(Vec::new()),
        })
    }

    fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &RequestEnvelope) -> Result<HttpResponse, FetchError> {
        self.urls.lock().unwrap().push(request.url.clone());
        Ok(HttpResponse::new(self.status, self.body))
    }
}

fn spawn_processor(
    store: Arc<dyn QueueStore>,
    fetcher: Arc<StaticFetcher>,
    shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let config = ProcessorConfig::default().with_poll_timeout(Duration::from_millis(100));
    let processor = RequestProcessor::new(store, fetcher, config);
    tokio::spawn(async move { processor.run(shutdown).await })
}

fn daemon_config() -> DaemonConfig {
    DaemonConfig::default()
        .with_response_poll_timeout(Duration::from_millis(100))
        .with_request_timeout(Duration::from_secs(5))
}

async fn jobs_on(store: &MemoryStore, queue: &str) -> Vec<JobEnvelope> {
    store
        .lrange(&job_queue_key(queue), 0, -1)
        .await
        .unwrap()
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap())
        .collect()
}

#[tokio::test]
async fn test_ledger_cycle_through_request_queue() {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn QueueStore> = memory.clone();
    let fetcher = StaticFetcher::new(200, LEDGER);
    let (shutdown_tx, _) = broadcast::channel(1);
    let processor = spawn_processor(Arc::clone(&store), Arc::clone(&fetcher), shutdown_tx.subscribe());

    let ctx = DaemonContext::new(
        "LedgerInfoDaemon",
        Arc::clone(&store),
        AppConfig::default(),
        daemon_config(),
        Transport::Queue,
    );
    let runner = DaemonRunner::new(Box::new(LedgerInfoDaemon::new()), ctx);

    assert_eq!(runner.run_once().await.unwrap(), 1);
    assert_eq!(runner.run_once().await.unwrap(), 0, "unchanged head enqueues nothing");

    let jobs = jobs_on(&memory, "ledger").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].class, "LedgerInfoJob");
    assert_eq!(jobs[0].args[0]["block_height"], 420000);
    assert_eq!(jobs[0].args[0]["network"], "mainnet");
    assert!(store.smembers(QUEUES_SET).await.unwrap().contains(&"ledger".to_string()));

    assert_eq!(
        fetcher.urls(),
        vec![
            "https://fullnode.mainnet.aptoslabs.com/v1/".to_string(),
            "https://fullnode.mainnet.aptoslabs.com/v1/".to_string(),
        ]
    );

    let _ = shutdown_tx.send(());
    processor.await.unwrap();
}

#[tokio::test]
async fn test_price_cycle_through_broker() {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn QueueStore> = memory.clone();
    let fetcher = StaticFetcher::new(200, r#"{"aptos":{"usd":9.87}}"#);
    let app = AppConfig::default().with_coingecko_url("https://coingecko.test/api/v3");
    let (shutdown_tx, _) = broadcast::channel(1);

    let manager = Arc::new(RequestManager::new(
        BrokerConfig::default(),
        Arc::clone(&store),
        &app,
    ));
    let manager_task = tokio::spawn(Arc::clone(&manager).run(shutdown_tx.subscribe()));
    let processor = spawn_processor(Arc::clone(&store), Arc::clone(&fetcher), shutdown_tx.subscribe());

    let ctx = DaemonContext::new(
        "CoinGeckoPriceDaemon",
        Arc::clone(&store),
        app,
        daemon_config(),
        Transport::Broker(Arc::clone(&manager)),
    );
    let runner = DaemonRunner::new(Box::new(CoinGeckoPriceDaemon::new()), ctx);

    assert_eq!(runner.run_once().await.unwrap(), 1);

    let jobs = jobs_on(&memory, "prices").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].class, "CoinPriceJob");
    assert_eq!(jobs[0].args[0]["price"], 9.87);
    assert_eq!(manager.stats().submitted, 1);
    assert_eq!(manager.stats().completed, 1);

    let _ = shutdown_tx.send(());
    processor.await.unwrap();
    manager_task.await.unwrap();
}

#[tokio::test]
async fn test_upstream_error_fails_cycle_without_jobs() {
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn QueueStore> = memory.clone();
    let fetcher = StaticFetcher::new(503, "unavailable");
    let (shutdown_tx, _) = broadcast::channel(1);
    let processor = spawn_processor(Arc::clone(&store), fetcher, shutdown_tx.subscribe());

    let ctx = DaemonContext::new(
        "LedgerInfoDaemon",
        Arc::clone(&store),
        AppConfig::default(),
        daemon_config(),
        Transport::Queue,
    );
    let runner = DaemonRunner::new(Box::new(LedgerInfoDaemon::new()), ctx);

    let err = runner.run_once().await.unwrap_err();
    assert!(matches!(err, DaemonError::UnexpectedStatus { status: 503, .. }));
    assert!(jobs_on(&memory, "ledger").await.is_empty());
    assert_eq!(runner.stats().cycles_failed, 1);

    let _ = shutdown_tx.send(());
    processor.await.unwrap();
}
