//! Vote participation per block.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::aptos::count_set_bits;
use super::block_proposals::BlockEventCursor;
use crate::daemon::{Daemon, DaemonContext};
use crate::dispatcher::{JobPayload, ValidatorVoteJob};
use crate::error::DaemonError;

/// Enqueues a `ValidatorVoteJob` per new block, counting the signers in
/// the block's `previous_block_votes_bitvec`.
///
/// Follows the same event stream as
/// [`BlockProposalsDaemon`](super::BlockProposalsDaemon) with its own cursor.
#[derive(Debug, Default)]
pub struct ValidatorVotesDaemon {
    cursor: BlockEventCursor,
}

impl ValidatorVotesDaemon {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Daemon for ValidatorVotesDaemon {
    fn name(&self) -> &'static str {
        "ValidatorVotesDaemon"
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
            match count_set_bits(&block.previous_block_votes_bitvec) {
                Some(votes_count) => {
                    ctx.dispatch(JobPayload::ValidatorVote(ValidatorVoteJob {
                        network: network.clone(),
                        epoch: block.epoch,
                        round: block.round,
                        height: block.height,
                        proposer: block.proposer,
                        votes_count,
                        votes_bitvec: block.previous_block_votes_bitvec,
                    }))
                    .await?;
                    enqueued += 1;
                }
                None => warn!(
                    sequence_number = event.sequence_number,
                    bitvec = %block.previous_block_votes_bitvec,
                    "Skipping block with malformed vote bitvec"
                ),
            }
            self.cursor.mark(event.sequence_number);
        }

        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemons::block_proposals::tests::block_event;
    use crate::daemons::testing::FakeNode;

    #[tokio::test]
    async fn test_counts_signers_and_skips_bad_bitvec() {
        let node = FakeNode::start();
        let events = format!(
            "[{},{}]",
            block_event(1, "0xff0f"),
            block_event(2, "0xnothex")
        );
        node.route("new_block_events?limit=25", 200, events);
        let ctx = node.context("ValidatorVotesDaemon");
        let mut daemon = ValidatorVotesDaemon::new();

        assert_eq!(daemon.run(&ctx).await.unwrap(), 1);
        assert_eq!(daemon.cursor.next(), Some(3));

        let jobs = node.jobs("votes").await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].class, "ValidatorVoteJob");
        assert_eq!(jobs[0].args[0]["votes_count"], 12);
        assert_eq!(jobs[0].args[0]["height"], 1);
    }
}
