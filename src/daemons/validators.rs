//! Validator set membership tracking.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;

use super::aptos::{
    resource_path, LedgerInfo, MoveResource, ValidatorInfo, ValidatorSet, FRAMEWORK_ADDRESS,
    VALIDATOR_SET,
};
use crate::daemon::{Daemon, DaemonContext};
use crate::dispatcher::{JobPayload, ValidatorSnapshotJob, ValidatorStatus};
use crate::error::DaemonError;

/// Validators of a set paired with their membership state.
pub(crate) fn members<'a>(
    set: &'a ValidatorSet,
) -> impl Iterator<Item = (&'a ValidatorInfo, ValidatorStatus)> + 'a {
    set.active_validators
        .iter()
        .map(|v| (v, ValidatorStatus::Active))
        .chain(set.pending_active.iter().map(|v| (v, ValidatorStatus::PendingActive)))
        .chain(set.pending_inactive.iter().map(|v| (v, ValidatorStatus::PendingInactive)))
}

/// Fetches the current validator set.
pub(crate) async fn fetch_validator_set(ctx: &DaemonContext) -> Result<ValidatorSet, DaemonError> {
    let url = ctx.node_url(&resource_path(FRAMEWORK_ADDRESS, VALIDATOR_SET));
    let resource: MoveResource<ValidatorSet> = ctx.fetch_json(&url).await?;
    Ok(resource.data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seen {
    validator_index: u64,
    voting_power: u64,
    status: ValidatorStatus,
}

/// Enqueues a `ValidatorSnapshotJob` per validator whose index, voting
/// power or membership state changed.
#[derive(Debug, Default)]
pub struct ValidatorsDaemon {
    seen: HashMap<String, Seen>,
}

impl ValidatorsDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs `set` against the cache. Validators that left the set are
    /// forgotten; the cache records a change only once its job is enqueued.
    fn diff(&mut self, network: &str, epoch: u64, set: &ValidatorSet) -> Vec<ValidatorSnapshotJob> {
        let mut changed = Vec::new();
        let present: HashSet<&str> = members(set).map(|(v, _)| v.addr.as_str()).collect();
        self.seen.retain(|addr, _| present.contains(addr.as_str()));

        for (validator, status) in members(set) {
            let seen = Seen {
                validator_index: validator.config.validator_index,
                voting_power: validator.voting_power,
                status,
            };
            if self.seen.get(&validator.addr) != Some(&seen) {
                changed.push(ValidatorSnapshotJob {
                    network: network.to_string(),
                    epoch,
                    address: validator.addr.clone(),
                    validator_index: seen.validator_index,
                    voting_power: seen.voting_power,
                    status,
                });
            }
        }

        changed
    }

    fn record(&mut self, job: &ValidatorSnapshotJob) {
        self.seen.insert(
            job.address.clone(),
            Seen {
                validator_index: job.validator_index,
                voting_power: job.voting_power,
                status: job.status,
            },
        );
    }
}

#[async_trait]
impl Daemon for ValidatorsDaemon {
    fn name(&self) -> &'static str {
        "ValidatorsDaemon"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(300)
    }

    async fn run(&mut self, ctx: &DaemonContext) -> Result<usize, DaemonError> {
        let ledger: LedgerInfo = ctx.fetch_json(&ctx.node_url("/")).await?;
        let set = fetch_validator_set(ctx).await?;

        let changed = self.diff(&ctx.network().to_string(), ledger.epoch, &set);
        let count = changed.len();
        for job in changed {
            ctx.dispatch(JobPayload::ValidatorSnapshot(job.clone())).await?;
            self.record(&job);
        }
        Ok(count)
    }
}
