//! Block proposal tracking from the `new_block_events` stream.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::aptos::{events_path, Event, NewBlockEvent, BLOCK_RESOURCE, FRAMEWORK_ADDRESS};
use crate::daemon::{Daemon, DaemonContext};
use crate::dispatcher::{BlockProposalJob, JobPayload};
use crate::error::DaemonError;

/// Events requested per page once a cursor exists.
const PAGE_LIMIT: u32 = 100;

/// Most recent events requested before a cursor exists.
const INITIAL_LIMIT: u32 = 25;

/// Sequence-number cursor over the `new_block_events` stream.
///
/// The first fetch starts at the most recent events; later fetches resume
/// after the last event marked.
#[derive(Debug, Default)]
pub(crate) struct BlockEventCursor {
    next: Option<u64>,
}

impl BlockEventCursor {
    pub(crate) fn next(&self) -> Option<u64> {
        self.next
    }

    /// Fetches events at or after the cursor, oldest first.
    pub(crate) async fn fetch(
        &self,
        ctx: &DaemonContext,
    ) -> Result<Vec<Event<NewBlockEvent>>, DaemonError> {
        let limit = if self.next.is_some() { PAGE_LIMIT } else { INITIAL_LIMIT };
        let path = events_path(FRAMEWORK_ADDRESS, BLOCK_RESOURCE, "new_block_events", self.next, limit);
        let mut events: Vec<Event<NewBlockEvent>> = ctx.fetch_json(&ctx.node_url(&path)).await?;

        events.sort_by_key(|e| e.sequence_number);
        if let Some(next) = self.next {
            events.retain(|e| e.sequence_number >= next);
        }
        Ok(events)
    }

    /// Moves the cursor past `sequence_number`.
    pub(crate) fn mark(&mut self, sequence_number: u64) {
        let next = sequence_number + 1;
        if self.next.map_or(true, |current| next > current) {
            self.next = Some(next);
        }
    }
}

/// Enqueues a `BlockProposalJob` per new block event.
#[derive(Debug, Default)]
pub struct BlockProposalsDaemon {
    cursor: BlockEventCursor,
}

impl BlockProposalsDaemon {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Daemon for BlockProposalsDaemon {
    fn name(&self) -> &'static str {
        "BlockProposalsDaemon"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn run(&mut self, ctx: &DaemonContext) -> Result<usize, DaemonError> {
        let events = self.cursor.fetch(ctx).await?;
        let network = ctx.network().to_string();

        let mut enqueued = 0;
        for event in events {
            let block = event.data;
            ctx.dispatch(JobPayload::BlockProposal(BlockProposalJob {
                network: network.clone(),
                sequence_number: event.sequence_number,
                epoch: block.epoch,
                round: block.round,
                height: block.height,
                proposer: block.proposer,
                failed_proposer_indices: block.failed_proposer_indices,
                timestamp_us: block.time_microseconds,
            }))
            .await?;
            self.cursor.mark(event.sequence_number);
            enqueued += 1;
        }

        debug!(next_sequence = ?self.cursor.next(), enqueued, "Block events processed");
        Ok(enqueued)
    }
}
