//! Typed job payloads for the worker runtime.
//!
//! Each kind names the worker class that persists it and the queue it is
//! routed to. The payload struct itself becomes `args[0]` of the envelope.

use serde::{Deserialize, Serialize};

/// Latest ledger state of the observed network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerInfoJob {
    pub network: String,
    pub chain_id: u8,
    pub epoch: u64,
    pub ledger_version: u64,
    pub block_height: u64,
    pub ledger_timestamp_us: u64,
}

/// Membership state of a validator within the validator set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    Active,
    PendingActive,
    PendingInactive,
}

/// A validator whose set membership or voting power changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorSnapshotJob {
    pub network: String,
    pub epoch: u64,
    pub address: String,
    pub validator_index: u64,
    pub voting_power: u64,
    pub status: ValidatorStatus,
}

/// Proposal counters of a validator within the current epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorPerformanceJob {
    pub network: String,
    pub epoch: u64,
    pub address: String,
    pub validator_index: u64,
    pub successful_proposals: u64,
    pub failed_proposals: u64,
}

/// An epoch boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochHistoryJob {
    pub network: String,
    pub epoch: u64,
    pub started_at_us: u64,
}

/// A produced block and who proposed it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockProposalJob {
    pub network: String,
    pub sequence_number: u64,
    pub epoch: u64,
    pub round: u64,
    pub height: u64,
    pub proposer: String,
    pub failed_proposer_indices: Vec<u64>,
    pub timestamp_us: u64,
}

/// Signer count of the votes certifying the previous block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorVoteJob {
    pub network: String,
    pub epoch: u64,
    pub round: u64,
    pub height: u64,
    pub proposer: String,
    pub votes_count: u32,
    pub votes_bitvec: String,
}

/// Rewards distributed to a stake pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StakeRewardJob {
    pub network: String,
    pub pool_address: String,
    pub sequence_number: u64,
    pub version: u64,
    pub rewards_amount: u64,
}

/// A spot price observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoinPriceJob {
    pub coin: String,
    pub currency: String,
    pub price: f64,
    pub observed_at: i64,
}

/// Every job kind the daemons produce.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum JobPayload {
    LedgerInfo(LedgerInfoJob),
    ValidatorSnapshot(ValidatorSnapshotJob),
    ValidatorPerformance(ValidatorPerformanceJob),
    EpochHistory(EpochHistoryJob),
    BlockProposal(BlockProposalJob),
    ValidatorVote(ValidatorVoteJob),
    StakeReward(StakeRewardJob),
    CoinPrice(CoinPriceJob),
}

impl JobPayload {
    /// Worker class on the runtime side.
    pub fn worker_class(&self) -> &'static str {
        match self {
            JobPayload::LedgerInfo(_) => "LedgerInfoJob",
            JobPayload::ValidatorSnapshot(_) => "ValidatorSnapshotJob",
            JobPayload::ValidatorPerformance(_) => "ValidatorPerformanceJob",
            JobPayload::EpochHistory(_) => "EpochHistoryJob",
            JobPayload::BlockProposal(_) => "BlockProposalJob",
            JobPayload::ValidatorVote(_) => "ValidatorVoteJob",
            JobPayload::StakeReward(_) => "StakeRewardJob",
            JobPayload::CoinPrice(_) => "CoinPriceJob",
        }
    }

    /// Queue the job is routed to.
    pub fn queue(&self) -> &'static str {
        match self {
            JobPayload::LedgerInfo(_) => "ledger",
            JobPayload::ValidatorSnapshot(_) => "validators",
            JobPayload::ValidatorPerformance(_) => "performance",
            JobPayload::EpochHistory(_) => "epochs",
            JobPayload::BlockProposal(_) => "blocks",
            JobPayload::ValidatorVote(_) => "votes",
            JobPayload::StakeReward(_) => "rewards",
            JobPayload::CoinPrice(_) => "prices",
        }
    }
}
