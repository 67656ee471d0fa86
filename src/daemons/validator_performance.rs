//! Per-epoch proposal counters of active validators.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::aptos::{
    resource_path, LedgerInfo, MoveResource, ValidatorPerformance, ValidatorSet,
    FRAMEWORK_ADDRESS, VALIDATOR_PERFORMANCE,
};
use super::validators::fetch_validator_set;
use crate::daemon::{Daemon, DaemonContext};
use crate::dispatcher::{JobPayload, ValidatorPerformanceJob};
use crate::error::DaemonError;

/// Enqueues a `ValidatorPerformanceJob` per active validator whose
/// proposal counters moved.
#[derive(Debug, Default)]
pub struct ValidatorPerformanceDaemon {
    /// address -> (epoch, successful, failed)
    seen: HashMap<String, (u64, u64, u64)>,
}

impl ValidatorPerformanceDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs for validators whose counters moved. The cache is updated by
    /// [`Self::record`] once a job is enqueued.
    fn diff(
        &self,
        network: &str,
        epoch: u64,
        set: &ValidatorSet,
        performance: &ValidatorPerformance,
    ) -> Vec<ValidatorPerformanceJob> {
        let mut changed = Vec::new();

        for validator in &set.active_validators {
            let index = validator.config.validator_index;
            let Some(counters) = performance.validators.get(index as usize) else {
                warn!(address = %validator.addr, index, "No performance entry for validator index");
                continue;
            };

            let current = (epoch, counters.successful_proposals, counters.failed_proposals);
            if self.seen.get(&validator.addr) == Some(&current) {
                continue;
            }
            changed.push(ValidatorPerformanceJob {
                network: network.to_string(),
                epoch,
                address: validator.addr.clone(),
                validator_index: index,
                successful_proposals: counters.successful_proposals,
                failed_proposals: counters.failed_proposals,
            });
        }

        changed
    }

    fn record(&mut self, job: &ValidatorPerformanceJob) {
        self.seen.insert(
            job.address.clone(),
            (job.epoch, job.successful_proposals, job.failed_proposals),
        );
    }
}

#[async_trait]
impl Daemon for ValidatorPerformanceDaemon {
    fn name(&self) -> &'static str {
        "ValidatorPerformanceDaemon"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&mut self, ctx: &DaemonContext) -> Result<usize, DaemonError> {
        let ledger: LedgerInfo = ctx.fetch_json(&ctx.node_url("/")).await?;
        let set = fetch_validator_set(ctx).await?;
        let url = ctx.node_url(&resource_path(FRAMEWORK_ADDRESS, VALIDATOR_PERFORMANCE));
        let performance: MoveResource<ValidatorPerformance> = ctx.fetch_json(&url).await?;

        let changed = self.diff(
            &ctx.network().to_string(),
            ledger.epoch,
            &set,
            &performance.data,
        );
        let count = changed.len();
        for job in changed {
            ctx.dispatch(JobPayload::ValidatorPerformance(job.clone())).await?;
            self.record(&job);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemons::testing::FakeNode;
    use crate::daemons::validators::tests::{validator, validator_set};

    fn performance(counters: &[(u64, u64)]) -> String {
        let entries: Vec<String> = counters
            .iter()
            .map(|(ok, failed)| {
                format!(
                    r#"{{"successful_proposals":"{}","failed_proposals":"{}"}}"#,
                    ok, failed
                )
            })
            .collect();
        format!(
            r#"{{"type":"0x1::stake::ValidatorPerformance","data":{{"validators":[{}]}}}}"#,
            entries.join(",")
        )
    }

    const LEDGER: &str = r#"{"chain_id":1,"epoch":"9","ledger_version":"5","ledger_timestamp":"1","block_height":"2"}"#;

    #[tokio::test]
    async fn test_enqueues_changed_counters_only() {
        let node = FakeNode::start();
        node.route("aptoslabs.com/v1/", 200, LEDGER);
        node.route(
            "stake::ValidatorSet",
            200,
            validator_set(&[validator("0xa", 0, 10), validator("0xb", 1, 10)], &[]),
        );
        node.route("stake::ValidatorPerformance", 200, performance(&[(5, 0), (3, 1)]));
        let ctx = node.context("ValidatorPerformanceDaemon");
        let mut daemon = ValidatorPerformanceDaemon::new();

        assert_eq!(daemon.run(&ctx).await.unwrap(), 2);
        assert_eq!(daemon.run(&ctx).await.unwrap(), 0);

        node.route("stake::ValidatorPerformance", 200, performance(&[(5, 0), (4, 1)]));
        assert_eq!(daemon.run(&ctx).await.unwrap(), 1);

        let jobs = node.jobs("performance").await;
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2].class, "ValidatorPerformanceJob");
        assert_eq!(jobs[2].args[0]["address"], "0xb");
        assert_eq!(jobs[2].args[0]["successful_proposals"], 4);
    }

    #[tokio::test]
    async fn test_failed_enqueue_is_retried_next_cycle() {
        let node = FakeNode::start();
        node.route("aptoslabs.com/v1/", 200, LEDGER);
        node.route(
            "stake::ValidatorSet",
            200,
            validator_set(&[validator("0xa", 0, 10), validator("0xb", 1, 10)], &[]),
        );
        node.route("stake::ValidatorPerformance", 200, performance(&[(5, 0), (3, 1)]));
        node.fail_job_writes(1);
        let ctx = node.context("ValidatorPerformanceDaemon");
        let mut daemon = ValidatorPerformanceDaemon::new();

        assert!(matches!(daemon.run(&ctx).await, Err(DaemonError::Dispatch(_))));
        assert_eq!(daemon.run(&ctx).await.unwrap(), 2);

        let jobs = node.jobs("performance").await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].args[0]["address"], "0xa");
    }

    #[test]
    fn test_missing_index_is_skipped() {
        let daemon = ValidatorPerformanceDaemon::new();
        let set: MoveResource<ValidatorSet> =
            serde_json::from_str(&validator_set(&[validator("0xa", 3, 1)], &[])).unwrap();
        let perf: MoveResource<ValidatorPerformance> =
            serde_json::from_str(&performance(&[(1, 1)])).unwrap();

        assert!(daemon.diff("mainnet", 1, &set.data, &perf.data).is_empty());
    }
}
