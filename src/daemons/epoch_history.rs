//! Epoch boundary tracking.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::aptos::{resource_path, MoveResource, ReconfigurationConfig, FRAMEWORK_ADDRESS, RECONFIGURATION};
use crate::daemon::{Daemon, DaemonContext};
use crate::dispatcher::{EpochHistoryJob, JobPayload};
use crate::error::DaemonError;

/// Enqueues an `EpochHistoryJob` each time the epoch advances.
#[derive(Debug, Default)]
pub struct EpochHistoryDaemon {
    last_epoch: Option<u64>,
}

impl EpochHistoryDaemon {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Daemon for EpochHistoryDaemon {
    fn name(&self) -> &'static str {
        "EpochHistoryDaemon"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn run(&mut self, ctx: &DaemonContext) -> Result<usize, DaemonError> {
        let url = ctx.node_url(&resource_path(FRAMEWORK_ADDRESS, RECONFIGURATION));
        let config: MoveResource<ReconfigurationConfig> = ctx.fetch_json(&url).await?;
        let config = config.data;

        if self.last_epoch.is_some_and(|last| config.epoch <= last) {
            return Ok(0);
        }

        info!(epoch = config.epoch, previous = ?self.last_epoch, "Epoch advanced");
        ctx.dispatch(JobPayload::EpochHistory(EpochHistoryJob {
            network: ctx.network().to_string(),
            epoch: config.epoch,
            started_at_us: config.last_reconfiguration_time,
        }))
        .await?;
        self.last_epoch = Some(config.epoch);
        Ok(1)
    }
}
