//! Runtime driving a daemon's poll cycles.
//!
//! The runner owns two tasks while started: the response listener for the
//! daemon's queue (queue transport only) and a poll loop ticking at the
//! daemon's interval. Each tick spawns a cycle unless the previous one is
//! still in flight, in which case the tick is dropped rather than queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::context::{DaemonContext, Transport};
use super::Daemon;
use crate::error::DaemonError;
use crate::metrics::MetricsCollector;

/// Statistics about a daemon runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    /// Cycles that completed without error.
    pub cycles_succeeded: u64,
    /// Cycles that returned an error.
    pub cycles_failed: u64,
    /// Ticks dropped because a cycle was still running.
    pub ticks_skipped: u64,
    /// Jobs enqueued across all cycles.
    pub jobs_enqueued: u64,
    /// Duration of the most recent cycle.
    pub last_cycle_duration: Duration,
}

#[derive(Default)]
struct SharedRunnerStats {
    cycles_succeeded: AtomicU64,
    cycles_failed: AtomicU64,
    ticks_skipped: AtomicU64,
    jobs_enqueued: AtomicU64,
    last_cycle_ms: AtomicU64,
}

impl SharedRunnerStats {
    fn record(&self, result: &Result<usize, DaemonError>, duration: Duration) {
        match result {
            Ok(jobs) => {
                self.cycles_succeeded.fetch_add(1, Ordering::SeqCst);
                self.jobs_enqueued.fetch_add(*jobs as u64, Ordering::SeqCst);
            }
            Err(_) => {
                self.cycles_failed.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.last_cycle_ms
            .store(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_runner_stats(&self) -> RunnerStats {
        RunnerStats {
            cycles_succeeded: self.cycles_succeeded.load(Ordering::SeqCst),
            cycles_failed: self.cycles_failed.load(Ordering::SeqCst),
            ticks_skipped: self.ticks_skipped.load(Ordering::SeqCst),
            jobs_enqueued: self.jobs_enqueued.load(Ordering::SeqCst),
            last_cycle_duration: Duration::from_millis(self.last_cycle_ms.load(Ordering::SeqCst)),
        }
    }
}

/// Clears the in-flight flag when a cycle ends, including by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// State shared between the runner, its poll loop and spawned cycles.
struct Cycle {
    name: &'static str,
    daemon: Mutex<Box<dyn Daemon>>,
    ctx: Arc<DaemonContext>,
    running: AtomicBool,
    stats: SharedRunnerStats,
    metrics: MetricsCollector,
}

impl Cycle {
    fn try_start(self: &Arc<Self>) -> Option<JoinHandle<Result<usize, DaemonError>>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.stats.ticks_skipped.fetch_add(1, Ordering::SeqCst);
            debug!(daemon = self.name, "Previous cycle still running, skipping tick");
            return None;
        }

        let cycle = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = RunningGuard(&cycle.running);
            cycle.execute().await
        }))
    }

    async fn execute(&self) -> Result<usize, DaemonError> {
        let mut daemon = self.daemon.lock().await;
        let started = Instant::now();

        let result = daemon.run(&self.ctx).await;
        let duration = started.elapsed();

        self.stats.record(&result, duration);
        self.metrics.record_daemon_run(self.name, result.is_ok());
        match &result {
            Ok(jobs) => info!(
                daemon = self.name,
                jobs_enqueued = *jobs,
                duration_ms = duration.as_millis() as u64,
                "Cycle completed"
            ),
            Err(e) => error!(
                daemon = self.name,
                error = %e,
                duration_ms = duration.as_millis() as u64,
                "Cycle failed"
            ),
        }
        result
    }
}

/// Drives one daemon.
pub struct DaemonRunner {
    cycle: Arc<Cycle>,
    interval: Duration,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl DaemonRunner {
    /// Creates a runner; nothing runs until [`DaemonRunner::start`].
    pub fn new(daemon: Box<dyn Daemon>, ctx: DaemonContext) -> Self {
        let name = daemon.name();
        let interval = daemon.interval();
        Self {
            cycle: Arc::new(Cycle {
                name,
                daemon: Mutex::new(daemon),
                ctx: Arc::new(ctx),
                running: AtomicBool::new(false),
                stats: SharedRunnerStats::default(),
                metrics: MetricsCollector::new(),
            }),
            interval,
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.cycle.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.cycle.ctx
    }

    /// Returns whether the poll loop is running.
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Returns whether a cycle is currently executing.
    pub fn is_cycle_in_flight(&self) -> bool {
        self.cycle.running.load(Ordering::SeqCst)
    }

    /// Returns current statistics.
    pub fn stats(&self) -> RunnerStats {
        self.cycle.stats.to_runner_stats()
    }

    /// Starts the response listener and the poll loop.
    ///
    /// The first cycle starts immediately.
    ///
    /// # Errors
    ///
    /// Returns `DaemonError::AlreadyRunning` if the runner was started.
    pub fn start(&mut self) -> Result<(), DaemonError> {
        if self.shutdown_tx.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        if let Some(listener) = self.spawn_listener(shutdown_tx.subscribe()) {
            self.handles.push(listener);
        }

        let cycle = Arc::clone(&self.cycle);
        let interval = self.interval;
        let shutdown = shutdown_tx.subscribe();
        self.handles
            .push(tokio::spawn(poll_loop(cycle, interval, shutdown)));

        self.shutdown_tx = Some(shutdown_tx);
        info!(
            daemon = self.name(),
            interval_secs = self.interval.as_secs(),
            "Daemon started"
        );
        Ok(())
    }

    /// Stops the poll loop and the listener.
    ///
    /// A cycle in flight is left to finish on its own.
    ///
    /// # Errors
    ///
    /// - `DaemonError::NotRunning` if the runner was not started
    /// - `DaemonError::ShutdownTimeout` if the tasks do not stop in time
    pub async fn stop(&mut self) -> Result<(), DaemonError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Err(DaemonError::NotRunning);
        };

        info!(daemon = self.name(), "Stopping daemon");
        // Tasks may have stopped already.
        let _ = shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Daemon task panicked during shutdown");
                }
            }
        };

        let timeout = self.cycle.ctx.config().shutdown_timeout;
        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(()) => {
                info!(daemon = self.name(), "Daemon stopped");
                Ok(())
            }
            Err(_) => Err(DaemonError::ShutdownTimeout(timeout)),
        }
    }

    /// Spawns a cycle unless one is already in flight.
    pub fn try_start_cycle(&self) -> Option<JoinHandle<Result<usize, DaemonError>>> {
        self.cycle.try_start()
    }

    /// Runs a single cycle and returns its result.
    ///
    /// When the runner is not started, a response listener is kept alive
    /// for the duration of the cycle.
    pub async fn run_once(&self) -> Result<usize, DaemonError> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listener = if self.is_running() {
            None
        } else {
            self.spawn_listener(shutdown_rx)
        };

        let result = match self.cycle.try_start() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(DaemonError::TaskFailed(e.to_string())),
            },
            None => Err(DaemonError::AlreadyRunning),
        };

        let _ = shutdown_tx.send(());
        if let Some(listener) = listener {
            // Stop without waiting out the pending blocking pop.
            listener.abort();
        }
        result
    }

    fn spawn_listener(&self, shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        if let Transport::Broker(_) = self.cycle.ctx.transport() {
            return None;
        }

        let ctx = Arc::clone(&self.cycle.ctx);
        Some(tokio::spawn(async move {
            ctx.router()
                .listen(
                    ctx.store().as_ref(),
                    ctx.config().response_poll_timeout,
                    shutdown,
                )
                .await
        }))
    }
}

impl Drop for DaemonRunner {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            warn!(daemon = self.cycle.name, "Daemon runner dropped while running");
            let _ = shutdown_tx.send(());
        }
    }
}

async fn poll_loop(cycle: Arc<Cycle>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Cycle errors are logged by the cycle itself.
                let _ = cycle.try_start();
            }
            _ = shutdown.recv() => break,
        }
    }

    debug!(daemon = cycle.name, "Poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, DaemonConfig};
    use crate::queue::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Daemon whose cycles take `work` and fail when `fail` is set.
    struct SlowDaemon {
        runs: Arc<AtomicUsize>,
        work: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Daemon for SlowDaemon {
        fn name(&self) -> &'static str {
            "SlowDaemon"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run(&mut self, _ctx: &DaemonContext) -> Result<usize, DaemonError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            if self.fail {
                Err(DaemonError::UnexpectedStatus {
                    url: "https://node/v1/".to_string(),
                    status: 503,
                })
            } else {
                Ok(2)
            }
        }
    }

    fn runner(work: Duration, fail: bool) -> (Arc<AtomicUsize>, DaemonRunner) {
        let runs = Arc::new(AtomicUsize::new(0));
        let daemon = SlowDaemon {
            runs: Arc::clone(&runs),
            work,
            fail,
        };
        let ctx = DaemonContext::new(
            "SlowDaemon",
            Arc::new(MemoryStore::new()),
            AppConfig::default(),
            DaemonConfig::default(),
            Transport::Queue,
        );
        (runs, DaemonRunner::new(Box::new(daemon), ctx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycle_is_dropped() {
        let (runs, runner) = runner(Duration::from_secs(90), false);

        let first = runner.try_start_cycle().expect("first cycle starts");
        tokio::task::yield_now().await;
        assert!(runner.is_cycle_in_flight());
        assert!(runner.try_start_cycle().is_none());

        assert_eq!(first.await.unwrap().unwrap(), 2);
        assert!(!runner.is_cycle_in_flight());

        let second = runner.try_start_cycle().expect("slot is free again");
        assert_eq!(second.await.unwrap().unwrap(), 2);

        let stats = runner.stats();
        assert_eq!(stats.ticks_skipped, 1);
        assert_eq!(stats.cycles_succeeded, 2);
        assert_eq!(stats.jobs_enqueued, 4);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_skips_ticks_during_long_cycle() {
        let (runs, mut runner) = runner(Duration::from_secs(150), false);

        runner.start().unwrap();
        tokio::time::sleep(Duration::from_secs(130)).await;

        // Ticks at 60 s and 120 s arrive while the first cycle runs.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.stats().ticks_skipped, 2);

        runner.stop().await.unwrap();
        assert!(!runner.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_stop_the_loop() {
        let (runs, mut runner) = runner(Duration::from_secs(1), true);

        runner.start().unwrap();
        tokio::time::sleep(Duration::from_secs(125)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(runner.stats().cycles_failed, 3);
        runner.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_state_machine() {
        let (_, mut runner) = runner(Duration::from_millis(10), false);

        assert!(matches!(runner.stop().await, Err(DaemonError::NotRunning)));
        runner.start().unwrap();
        assert!(matches!(runner.start(), Err(DaemonError::AlreadyRunning)));
        runner.stop().await.unwrap();
        runner.start().unwrap();
        runner.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_reports_cycle_result() {
        let (_, ok_runner) = runner(Duration::from_millis(10), false);
        assert_eq!(ok_runner.run_once().await.unwrap(), 2);

        let (_, failing_runner) = runner(Duration::from_millis(10), true);
        let err = failing_runner.run_once().await.unwrap_err();
        assert!(matches!(err, DaemonError::UnexpectedStatus { status: 503, .. }));
        assert_eq!(failing_runner.stats().cycles_failed, 1);
    }
}
