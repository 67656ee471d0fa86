//! Ledger head tracking.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::aptos::LedgerInfo;
use crate::daemon::{Daemon, DaemonContext};
use crate::dispatcher::{JobPayload, LedgerInfoJob};
use crate::error::DaemonError;

/// Enqueues a `LedgerInfoJob` whenever the block height moves.
#[derive(Debug, Default)]
pub struct LedgerInfoDaemon {
    last_block_height: Option<u64>,
}

impl LedgerInfoDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the job to enqueue for `info`, if the head moved.
    fn observe(&self, network: &str, info: LedgerInfo) -> Option<LedgerInfoJob> {
        if self.last_block_height == Some(info.block_height) {
            return None;
        }
        Some(LedgerInfoJob {
            network: network.to_string(),
            chain_id: info.chain_id,
            epoch: info.epoch,
            ledger_version: info.ledger_version,
            block_height: info.block_height,
            ledger_timestamp_us: info.ledger_timestamp,
        })
    }
}

#[async_trait]
impl Daemon for LedgerInfoDaemon {
    fn name(&self) -> &'static str {
        "LedgerInfoDaemon"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn run(&mut self, ctx: &DaemonContext) -> Result<usize, DaemonError> {
        let info: LedgerInfo = ctx.fetch_json(&ctx.node_url("/")).await?;
        let network = ctx.network().to_string();

        match self.observe(&network, info) {
            Some(job) => {
                let block_height = job.block_height;
                ctx.dispatch(JobPayload::LedgerInfo(job)).await?;
                self.last_block_height = Some(block_height);
                Ok(1)
            }
            None => {
                debug!(block_height = ?self.last_block_height, "Ledger head unchanged");
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemons::testing::FakeNode;

    fn ledger(height: u64) -> String {
        format!(
            r#"{{"chain_id":1,"epoch":"50","ledger_version":"{}","ledger_timestamp":"1718000000000000","block_height":"{}","node_role":"full_node"}}"#,
            height * 3,
            height
        )
    }

    #[tokio::test]
    async fn test_enqueues_only_when_height_changes() {
        let node = FakeNode::start();
        node.route("aptoslabs.com/v1/", 200, ledger(100));
        let ctx = node.context("LedgerInfoDaemon");
        let mut daemon = LedgerInfoDaemon::new();

        assert_eq!(daemon.run(&ctx).await.unwrap(), 1);
        assert_eq!(daemon.run(&ctx).await.unwrap(), 0);
        node.route("aptoslabs.com/v1/", 200, ledger(101));
        assert_eq!(daemon.run(&ctx).await.unwrap(), 1);

        let jobs = node.jobs("ledger").await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].class, "LedgerInfoJob");
        assert_eq!(jobs[0].args[0]["block_height"], 100);
        assert_eq!(jobs[1].args[0]["block_height"], 101);
        assert_eq!(jobs[1].args[0]["network"], "mainnet");
    }

    #[tokio::test]
    async fn test_node_error_fails_cycle_without_job() {
        let node = FakeNode::start();
        node.route("aptoslabs.com/v1/", 503, "unavailable");
        let ctx = node.context("LedgerInfoDaemon");
        let mut daemon = LedgerInfoDaemon::new();

        let err = daemon.run(&ctx).await.unwrap_err();
        assert!(matches!(err, DaemonError::UnexpectedStatus { status: 503, .. }));
        assert!(node.jobs("ledger").await.is_empty());
        assert_eq!(daemon.last_block_height, None);
    }

    #[tokio::test]
    async fn test_failed_enqueue_is_retried_next_cycle() {
        let node = FakeNode::start();
        node.route("aptoslabs.com/v1/", 200, ledger(100));
        node.fail_job_writes(1);
        let ctx = node.context("LedgerInfoDaemon");
        let mut daemon = LedgerInfoDaemon::new();

        let err = daemon.run(&ctx).await.unwrap_err();
        assert!(matches!(err, DaemonError::Dispatch(_)));
        assert_eq!(daemon.last_block_height, None);

        assert_eq!(daemon.run(&ctx).await.unwrap(), 1);
        let jobs = node.jobs("ledger").await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].args[0]["block_height"], 100);
    }
}
