//! Staking reward history per validator pool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::aptos::{events_path, DistributeRewardsEvent, Event, STAKE_POOL};
use super::validators::fetch_validator_set;
use crate::daemon::{Daemon, DaemonContext};
use crate::dispatcher::{JobPayload, StakeRewardJob};
use crate::error::DaemonError;

/// Most recent reward events requested per pool.
const EVENTS_LIMIT: u32 = 25;

/// Enqueues a `StakeRewardJob` per reward distribution event not seen yet.
///
/// Pools are polled one after another. A pool that fails is skipped for
/// this cycle; the cycle fails only when every pool failed.
#[derive(Debug, Default)]
pub struct StakeHistoryDaemon {
    /// pool address -> highest sequence number enqueued
    cursors: HashMap<String, u64>,
}

impl StakeHistoryDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_new(&self, pool: &str, sequence_number: u64) -> bool {
        self.cursors
            .get(pool)
            .map_or(true, |last| sequence_number > *last)
    }

    async fn poll_pool(&mut self, ctx: &DaemonContext, pool: &str) -> Result<usize, DaemonError> {
        let path = events_path(pool, STAKE_POOL, "distribute_rewards_events", None, EVENTS_LIMIT);
        let mut events: Vec<Event<DistributeRewardsEvent>> =
            ctx.fetch_json(&ctx.node_url(&path)).await?;
        events.sort_by_key(|e| e.sequence_number);

        let mut enqueued = 0;
        for event in events {
            if !self.is_new(pool, event.sequence_number) {
                continue;
            }
            ctx.dispatch(JobPayload::StakeReward(StakeRewardJob {
                network: ctx.network().to_string(),
                pool_address: event.data.pool_address,
                sequence_number: event.sequence_number,
                version: event.version,
                rewards_amount: event.data.rewards_amount,
            }))
            .await?;
            self.cursors.insert(pool.to_string(), event.sequence_number);
            enqueued += 1;
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl Daemon for StakeHistoryDaemon {
    fn name(&self) -> &'static str {
        "StakeHistoryDaemon"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(900)
    }

    async fn run(&mut self, ctx: &DaemonContext) -> Result<usize, DaemonError> {
        let set = fetch_validator_set(ctx).await?;
        let pools: Vec<String> = set.active_validators.iter().map(|v| v.addr.clone()).collect();

        let mut enqueued = 0;
        let mut last_error = None;
        let mut failures = 0;
        for pool in &pools {
            match self.poll_pool(ctx, pool).await {
                Ok(count) => enqueued += count,
                Err(e) => {
                    warn!(pool = %pool, error = %e, "Failed to poll stake pool rewards");
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if failures == pools.len() => Err(e),
            _ => Ok(enqueued),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemons::testing::FakeNode;
    use crate::daemons::validators::tests::{validator, validator_set};

    fn rewards(pool: &str, seqs: &[u64]) -> String {
        let events: Vec<String> = seqs
            .iter()
            .map(|seq| {
                format!(
                    r#"{{"version":"{}","guid":{{"creation_number":"9","account_address":"{}"}},"sequence_number":"{}","type":"0x1::stake::DistributeRewardsEvent","data":{{"pool_address":"{}","rewards_amount":"{}"}}}}"#,
                    seq * 1000,
                    pool,
                    seq,
                    pool,
                    seq * 50
                )
            })
            .collect();
        format!("[{}]", events.join(","))
    }

    #[tokio::test]
    async fn test_enqueues_new_rewards_per_pool() {
        let node = FakeNode::start();
        node.route(
            "stake::ValidatorSet",
            200,
            validator_set(&[validator("0xaa", 0, 1), validator("0xbb", 1, 1)], &[]),
        );
        node.route("accounts/0xaa/events", 200, rewards("0xaa", &[0, 1]));
        node.route("accounts/0xbb/events", 200, rewards("0xbb", &[4]));
        let ctx = node.context("StakeHistoryDaemon");
        let mut daemon = StakeHistoryDaemon::new();

        assert_eq!(daemon.run(&ctx).await.unwrap(), 3);
        assert_eq!(daemon.run(&ctx).await.unwrap(), 0);

        node.route("accounts/0xaa/events", 200, rewards("0xaa", &[1, 2]));
        assert_eq!(daemon.run(&ctx).await.unwrap(), 1);

        let jobs = node.jobs("rewards").await;
        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs[3].class, "StakeRewardJob");
        assert_eq!(jobs[3].args[0]["pool_address"], "0xaa");
        assert_eq!(jobs[3].args[0]["rewards_amount"], 100);
    }

    #[tokio::test]
    async fn test_single_pool_failure_does_not_fail_cycle() {
        let node = FakeNode::start();
        node.route(
            "stake::ValidatorSet",
            200,
            validator_set(&[validator("0xaa", 0, 1), validator("0xbb", 1, 1)], &[]),
        );
        node.route("accounts/0xaa/events", 200, rewards("0xaa", &[0]));
        node.route("accounts/0xbb/events", 500, "boom");
        let ctx = node.context("StakeHistoryDaemon");

        assert_eq!(StakeHistoryDaemon::new().run(&ctx).await.unwrap(), 1);

        node.route("accounts/0xaa/events", 500, "boom");
        let err = StakeHistoryDaemon::new().run(&ctx).await.unwrap_err();
        assert!(matches!(err, DaemonError::UnexpectedStatus { status: 500, .. }));
    }
}
