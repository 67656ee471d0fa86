//! CLI command definitions for validator-pulse.
//!
//! Each long-running command runs until Ctrl-C, then stops its components
//! in reverse start order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{BrokerStats, RequestManager, RequestProcessor, ReqwestFetcher};
use crate::config::{AppConfig, BrokerConfig, DaemonConfig, ProcessorConfig, DEFAULT_REDIS_URL};
use crate::daemon::{Daemon, DaemonContext, DaemonRunner, Transport};
use crate::daemons::{all_daemons, create_daemon};
use crate::dispatcher::{JobDispatcher, JobEnvelope};
use crate::metrics::{export_metrics, init_metrics};
use crate::queue::keys::{job_queue_key, MONITORING_KEY, QUEUES_SET, REQUEST_QUEUE, SCHEDULE_SET};
use crate::queue::{MemoryStore, QueueStore, RedisStore};

/// Aptos validator analytics pollers, request broker and job enqueuer.
#[derive(Parser)]
#[command(name = "validator-pulse")]
#[command(about = "Poll Aptos validator data and enqueue jobs for the worker runtime")]
#[command(version)]
#[command(
    long_about = "validator-pulse runs periodic daemons against an Aptos fullnode and CoinGecko,\nroutes their HTTP traffic through a Redis request/response queue pair, and enqueues\nSidekiq-compatible jobs for what changed.\n\nExample usage:\n  validator-pulse run-all --network mainnet\n  validator-pulse once ledger-info --memory"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// Aptos network: mainnet, testnet, devnet or a fullnode URL.
    #[arg(long, env = "APTOS_NETWORK", default_value = "mainnet", global = true)]
    pub network: String,

    /// Print Prometheus metrics when a long-running command stops.
    #[arg(long, global = true)]
    pub print_metrics: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume the request queue and perform HTTP calls.
    Processor(ProcessorArgs),

    /// Run one daemon continuously.
    Daemon(DaemonArgs),

    /// Run a single cycle of one daemon and exit.
    Once(OnceArgs),

    /// Run every daemon, a broker and a processor in one process.
    #[command(name = "run-all")]
    RunAll(RunAllArgs),

    /// Enqueue a raw job.
    Enqueue(EnqueueArgs),

    /// Show the broker snapshot and queue depths.
    #[command(alias = "status")]
    Monitor(MonitorArgs),
}

#[derive(Parser, Debug)]
pub struct ProcessorArgs {
    /// Per-attempt HTTP timeout in seconds.
    #[arg(long, default_value = "15")]
    pub fetch_timeout: u64,
}

#[derive(Parser, Debug)]
pub struct DaemonArgs {
    /// Daemon class name (LedgerInfoDaemon) or short name (ledger-info).
    pub name: String,

    /// Submit requests through an in-process rate-limited broker.
    #[arg(long)]
    pub broker: bool,
}

#[derive(Parser, Debug)]
pub struct OnceArgs {
    /// Daemon class name (LedgerInfoDaemon) or short name (ledger-info).
    pub name: String,

    /// Use an in-memory store with an in-process processor and print the
    /// jobs instead of writing them to Redis.
    #[arg(long)]
    pub memory: bool,
}

#[derive(Parser, Debug)]
pub struct RunAllArgs {
    /// Do not start a processor; another process consumes the request queue.
    #[arg(long)]
    pub no_processor: bool,

    /// Per-attempt HTTP timeout in seconds for the embedded processor.
    #[arg(long, default_value = "15")]
    pub fetch_timeout: u64,
}

#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Worker class name.
    pub class: String,

    /// JSON payload; `queue` and `at` fields are honored.
    pub payload: String,
}

#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let app = app_config(&cli)?;
    info!(
        environment = %app.environment,
        network = %app.network,
        git_hash = ?app.git_hash,
        production = app.is_production(),
        "Configuration loaded"
    );

    let print_metrics = cli.print_metrics;
    match cli.command {
        Commands::Processor(args) => run_processor_command(app, args, print_metrics).await,
        Commands::Daemon(args) => run_daemon_command(app, args, print_metrics).await,
        Commands::Once(args) => run_once_command(app, args).await,
        Commands::RunAll(args) => run_all_command(app, args, print_metrics).await,
        Commands::Enqueue(args) => run_enqueue_command(app, args).await,
        Commands::Monitor(args) => run_monitor_command(app, args).await,
    }
}

/// Environment configuration overridden by the global flags.
fn app_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let network = cli.network.parse().context("invalid --network")?;
    let app = AppConfig::from_env()
        .context("invalid environment configuration")?
        .with_redis_url(&cli.redis_url)
        .with_network(network);
    app.validate().context("invalid --redis-url")?;
    Ok(app)
}

async fn connect(app: &AppConfig) -> anyhow::Result<RedisStore> {
    RedisStore::connect(&app.redis_url)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", app.redis_url))
}

fn start_metrics() {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }
}

fn finish_metrics(print_metrics: bool) {
    if print_metrics {
        print!("{}", export_metrics());
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }
    info!("Shutdown requested");
}

fn spawn_processor(
    store: Arc<dyn QueueStore>,
    fetch_timeout: u64,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<JoinHandle<()>> {
    let config = ProcessorConfig::default().with_fetch_timeout(Duration::from_secs(fetch_timeout));
    let fetcher = ReqwestFetcher::new(config.fetch_timeout).context("failed to build HTTP client")?;
    let processor = RequestProcessor::new(store, Arc::new(fetcher), config);
    Ok(tokio::spawn(async move { processor.run(shutdown).await }))
}

// ============================================================================
// Long-running commands
// ============================================================================

async fn run_processor_command(
    app: AppConfig,
    args: ProcessorArgs,
    print_metrics: bool,
) -> anyhow::Result<()> {
    start_metrics();
    let store: Arc<dyn QueueStore> = Arc::new(connect(&app).await?);
    let (shutdown_tx, _) = broadcast::channel(1);

    let handle = spawn_processor(store, args.fetch_timeout, shutdown_tx.subscribe())?;
    wait_for_ctrl_c().await;

    let _ = shutdown_tx.send(());
    handle.await.context("processor task failed")?;
    finish_metrics(print_metrics);
    Ok(())
}

async fn run_daemon_command(
    app: AppConfig,
    args: DaemonArgs,
    print_metrics: bool,
) -> anyhow::Result<()> {
    start_metrics();
    let daemon = create_daemon(&args.name)?;
    let store = connect(&app).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut manager_handle = None;
    let transport = if args.broker {
        let manager = Arc::new(RequestManager::new(
            BrokerConfig::default(),
            Arc::new(store.duplicate().await?),
            &app,
        ));
        manager_handle = Some(tokio::spawn(Arc::clone(&manager).run(shutdown_tx.subscribe())));
        Transport::Broker(manager)
    } else {
        Transport::Queue
    };

    let mut runner = runner_for(daemon, Arc::new(store), &app, transport);
    runner.start()?;
    wait_for_ctrl_c().await;

    let stopped = runner.stop().await;
    let _ = shutdown_tx.send(());
    if let Some(handle) = manager_handle {
        handle.await.context("request manager task failed")?;
    }
    finish_metrics(print_metrics);
    stopped?;
    Ok(())
}

async fn run_all_command(
    app: AppConfig,
    args: RunAllArgs,
    print_metrics: bool,
) -> anyhow::Result<()> {
    start_metrics();
    let store = connect(&app).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    // Listeners block on their own connections.
    let manager = Arc::new(RequestManager::new(
        BrokerConfig::default(),
        Arc::new(store.duplicate().await?),
        &app,
    ));
    let manager_handle = tokio::spawn(Arc::clone(&manager).run(shutdown_tx.subscribe()));

    let processor_handle = if args.no_processor {
        None
    } else {
        let processor_store: Arc<dyn QueueStore> = Arc::new(store.duplicate().await?);
        Some(spawn_processor(
            processor_store,
            args.fetch_timeout,
            shutdown_tx.subscribe(),
        )?)
    };

    let shared: Arc<dyn QueueStore> = Arc::new(store);
    let mut runners: Vec<DaemonRunner> = all_daemons()
        .into_iter()
        .map(|daemon| {
            runner_for(
                daemon,
                Arc::clone(&shared),
                &app,
                Transport::Broker(Arc::clone(&manager)),
            )
        })
        .collect();
    for runner in &mut runners {
        runner.start()?;
    }
    info!(daemons = runners.len(), "All daemons started");

    wait_for_ctrl_c().await;

    for runner in &mut runners {
        if let Err(e) = runner.stop().await {
            warn!(daemon = runner.name(), error = %e, "Daemon did not stop cleanly");
        }
    }
    let _ = shutdown_tx.send(());
    if let Some(handle) = processor_handle {
        handle.await.context("processor task failed")?;
    }
    manager_handle
        .await
        .context("request manager task failed")?;

    for runner in &runners {
        let stats = runner.stats();
        info!(
            daemon = runner.name(),
            cycles_succeeded = stats.cycles_succeeded,
            cycles_failed = stats.cycles_failed,
            ticks_skipped = stats.ticks_skipped,
            jobs_enqueued = stats.jobs_enqueued,
            "Daemon summary"
        );
    }
    finish_metrics(print_metrics);
    Ok(())
}

fn runner_for(
    daemon: Box<dyn Daemon>,
    store: Arc<dyn QueueStore>,
    app: &AppConfig,
    transport: Transport,
) -> DaemonRunner {
    let ctx = DaemonContext::new(
        daemon.name(),
        store,
        app.clone(),
        DaemonConfig::default(),
        transport,
    );
    DaemonRunner::new(daemon, ctx)
}

// ============================================================================
// One-shot commands
// ============================================================================

async fn run_once_command(app: AppConfig, args: OnceArgs) -> anyhow::Result<()> {
    let daemon = create_daemon(&args.name)?;
    let name = daemon.name();

    if !args.memory {
        let store: Arc<dyn QueueStore> = Arc::new(connect(&app).await?);
        let runner = runner_for(daemon, store, &app, Transport::Queue);
        let jobs = runner
            .run_once()
            .await
            .with_context(|| format!("{} cycle failed", name))?;
        info!(daemon = name, jobs_enqueued = jobs, "Cycle finished");
        return Ok(());
    }

    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn QueueStore> = memory.clone();
    let (shutdown_tx, _) = broadcast::channel(1);
    let processor = spawn_processor(Arc::clone(&store), 15, shutdown_tx.subscribe())?;

    let runner = runner_for(daemon, Arc::clone(&store), &app, Transport::Queue);
    let result = runner.run_once().await;
    let _ = shutdown_tx.send(());
    processor.abort();
    let jobs = result.with_context(|| format!("{} cycle failed", name))?;

    let envelopes = collect_jobs(memory.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&envelopes)?);
    info!(daemon = name, jobs_enqueued = jobs, "Dry run finished");
    Ok(())
}

/// Every envelope waiting in the store, immediate then scheduled.
async fn collect_jobs(store: &dyn QueueStore) -> anyhow::Result<Vec<JobEnvelope>> {
    let mut envelopes = Vec::new();
    let mut raws = Vec::new();
    for queue in store.smembers(QUEUES_SET).await? {
        raws.extend(store.lrange(&job_queue_key(&queue), 0, -1).await?);
    }
    raws.extend(store.zrange_by_score(SCHEDULE_SET, f64::NEG_INFINITY, f64::INFINITY).await?);

    for raw in raws {
        envelopes.push(serde_json::from_str(&raw).context("malformed job envelope")?);
    }
    Ok(envelopes)
}

async fn run_enqueue_command(app: AppConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;
    let store: Arc<dyn QueueStore> = Arc::new(connect(&app).await?);

    let jid = JobDispatcher::new(store).enqueue(&args.class, payload).await?;
    println!("{}", jid);
    Ok(())
}

/// Read side of the terminal dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub broker: Option<BrokerStats>,
    pub request_queue_depth: usize,
    pub scheduled_jobs: usize,
    pub queues: Vec<QueueDepth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    pub name: String,
    pub depth: usize,
}

async fn build_monitor_report(store: &dyn QueueStore) -> anyhow::Result<MonitorReport> {
    let broker = match store.get(MONITORING_KEY).await? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed monitoring snapshot");
                None
            }
        },
        None => None,
    };

    let mut names = store.smembers(QUEUES_SET).await?;
    names.sort();
    let mut queues = Vec::with_capacity(names.len());
    for name in names {
        let depth = store.llen(&job_queue_key(&name)).await?;
        queues.push(QueueDepth { name, depth });
    }

    Ok(MonitorReport {
        broker,
        request_queue_depth: store.llen(REQUEST_QUEUE).await?,
        scheduled_jobs: store
            .zrange_by_score(SCHEDULE_SET, f64::NEG_INFINITY, f64::INFINITY)
            .await?
            .len(),
        queues,
    })
}

async fn run_monitor_command(app: AppConfig, args: MonitorArgs) -> anyhow::Result<()> {
    let store = connect(&app).await?;
    let report = build_monitor_report(&store).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    match &report.broker {
        Some(stats) => {
            println!("Broker ({} @ {})", stats.environment, stats.updated_at);
            println!(
                "  rps {}/{}  quota {}/{}  pending {}  in-flight urls {}",
                stats.current_rps,
                stats.max_rps,
                stats.current_quota,
                stats.max_quota,
                stats.pending,
                stats.in_flight_urls
            );
            println!(
                "  submitted {}  duplicates {}  rate limited {}  completed {}  failed {}  timed out {}",
                stats.submitted,
                stats.duplicate_requests,
                stats.rate_limited,
                stats.completed,
                stats.failed,
                stats.timed_out
            );
        }
        None => println!("Broker: no snapshot"),
    }
    println!("request_queue: {}", report.request_queue_depth);
    println!("schedule: {}", report.scheduled_jobs);
    for queue in &report.queues {
        println!("queue:{}: {}", queue.name, queue.depth);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_global_flags_and_defaults() {
        let cli = Cli::try_parse_from(["validator-pulse", "once", "ledger-info"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        assert!(!cli.print_metrics);
        match cli.command {
            Commands::Once(args) => {
                assert_eq!(args.name, "ledger-info");
                assert!(!args.memory);
            }
            _ => panic!("Expected Once command"),
        }
    }

    #[test]
    fn test_run_all_with_options() {
        let cli = Cli::try_parse_from([
            "validator-pulse",
            "run-all",
            "--no-processor",
            "--network",
            "testnet",
            "-l",
            "debug",
        ])
        .expect("should parse");

        assert_eq!(cli.network, "testnet");
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::RunAll(args) => {
                assert!(args.no_processor);
                assert_eq!(args.fetch_timeout, 15);
            }
            _ => panic!("Expected RunAll command"),
        }
    }

    #[test]
    fn test_enqueue_and_monitor_alias() {
        let cli = Cli::try_parse_from(["validator-pulse", "enqueue", "LedgerInfoJob", r#"{"a":1}"#])
            .expect("should parse");
        assert!(matches!(cli.command, Commands::Enqueue(ref a) if a.class == "LedgerInfoJob"));

        let cli = Cli::try_parse_from(["validator-pulse", "status", "-j"]).expect("should parse");
        assert!(matches!(cli.command, Commands::Monitor(ref a) if a.json));
    }

    #[test]
    fn test_app_config_rejects_unknown_network() {
        let cli = Cli::try_parse_from(["validator-pulse", "--network", "moonnet", "monitor"])
            .expect("should parse");
        assert!(app_config(&cli).is_err());
    }

    #[test]
    fn test_app_config_rejects_non_redis_url() {
        let cli = Cli::try_parse_from(["validator-pulse", "--redis-url", "localhost:6379", "monitor"])
            .expect("should parse");
        assert!(app_config(&cli).is_err());
    }

    #[tokio::test]
    async fn test_monitor_report_reads_snapshot_and_depths() {
        let store = MemoryStore::new();
        store
            .set(MONITORING_KEY, serde_json::to_string(&BrokerStats::default()).unwrap())
            .await
            .unwrap();
        store.sadd(QUEUES_SET, "validators").await.unwrap();
        store.rpush("queue:validators", "{}".to_string()).await.unwrap();
        store.rpush("queue:validators", "{}".to_string()).await.unwrap();
        store.rpush(REQUEST_QUEUE, "{}".to_string()).await.unwrap();

        let report = build_monitor_report(&store).await.unwrap();
        assert!(report.broker.is_some());
        assert_eq!(report.request_queue_depth, 1);
        assert_eq!(report.scheduled_jobs, 0);
        assert_eq!(report.queues.len(), 1);
        assert_eq!(report.queues[0].depth, 2);
    }

    #[tokio::test]
    async fn test_collect_jobs_includes_scheduled() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = JobDispatcher::new(store.clone());
        dispatcher
            .enqueue("CoinPriceJob", json!({"queue": "prices", "price": 1.0}))
            .await
            .unwrap();
        dispatcher
            .enqueue("CoinPriceJob", json!({"at": 1_900_000_000.0}))
            .await
            .unwrap();

        let jobs = collect_jobs(store.as_ref()).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].queue, "prices");
        assert!(jobs[1].at.is_some());
    }
}
