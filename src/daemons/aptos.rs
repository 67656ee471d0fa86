//! Aptos fullnode REST API types and paths.
//!
//! The node encodes u64 values as JSON strings.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

/// Framework account holding the on-chain config resources.
pub const FRAMEWORK_ADDRESS: &str = "0x1";

pub const VALIDATOR_SET: &str = "0x1::stake::ValidatorSet";
pub const VALIDATOR_PERFORMANCE: &str = "0x1::stake::ValidatorPerformance";
pub const RECONFIGURATION: &str = "0x1::reconfiguration::Configuration";
pub const BLOCK_RESOURCE: &str = "0x1::block::BlockResource";
pub const STAKE_POOL: &str = "0x1::stake::StakePool";

/// Deserializes a value the node sends as a string.
pub fn deserialize_from_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    let s = <String>::deserialize(deserializer)?;
    s.parse::<T>().map_err(serde::de::Error::custom)
}

fn deserialize_vec_from_strings<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    raw.iter()
        .map(|s| s.parse::<u64>().map_err(serde::de::Error::custom))
        .collect()
}

/// Path of a resource on an account.
pub fn resource_path(address: &str, resource_type: &str) -> String {
    format!("accounts/{}/resource/{}", address, resource_type)
}

/// Path of an event stream declared by `handle_struct`.
///
/// Without `start` the node returns the most recent events.
pub fn events_path(address: &str, handle_struct: &str, field: &str, start: Option<u64>, limit: u32) -> String {
    match start {
        Some(start) => format!(
            "accounts/{}/events/{}/{}?start={}&limit={}",
            address, handle_struct, field, start, limit
        ),
        None => format!(
            "accounts/{}/events/{}/{}?limit={}",
            address, handle_struct, field, limit
        ),
    }
}

/// Response of `GET /`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LedgerInfo {
    pub chain_id: u8,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub epoch: u64,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub ledger_version: u64,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub block_height: u64,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub ledger_timestamp: u64,
}

/// Envelope of `GET /accounts/{address}/resource/{type}`.
#[derive(Debug, Clone, Deserialize)]
pub struct MoveResource<T> {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub data: T,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ValidatorConfig {
    #[serde(deserialize_with = "deserialize_from_string")]
    pub validator_index: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ValidatorInfo {
    pub addr: String,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub voting_power: u64,
    pub config: ValidatorConfig,
}

/// Data of `0x1::stake::ValidatorSet`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ValidatorSet {
    pub active_validators: Vec<ValidatorInfo>,
    #[serde(default)]
    pub pending_active: Vec<ValidatorInfo>,
    #[serde(default)]
    pub pending_inactive: Vec<ValidatorInfo>,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub total_voting_power: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IndividualValidatorPerformance {
    #[serde(deserialize_with = "deserialize_from_string")]
    pub successful_proposals: u64,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub failed_proposals: u64,
}

/// Data of `0x1::stake::ValidatorPerformance`, indexed by validator index.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ValidatorPerformance {
    pub validators: Vec<IndividualValidatorPerformance>,
}

/// Data of `0x1::reconfiguration::Configuration`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReconfigurationConfig {
    #[serde(deserialize_with = "deserialize_from_string")]
    pub epoch: u64,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub last_reconfiguration_time: u64,
}

/// One entry of an event stream.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Event<T> {
    #[serde(deserialize_with = "deserialize_from_string")]
    pub version: u64,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub sequence_number: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: T,
}

/// Data of `0x1::block::NewBlockEvent`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NewBlockEvent {
    #[serde(deserialize_with = "deserialize_from_string")]
    pub epoch: u64,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub round: u64,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub height: u64,
    pub proposer: String,
    pub previous_block_votes_bitvec: String,
    #[serde(deserialize_with = "deserialize_vec_from_strings")]
    pub failed_proposer_indices: Vec<u64>,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub time_microseconds: u64,
}

/// Data of `0x1::stake::DistributeRewardsEvent`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DistributeRewardsEvent {
    pub pool_address: String,
    #[serde(deserialize_with = "deserialize_from_string")]
    pub rewards_amount: u64,
}

/// Number of set bits in a `0x`-prefixed hex bitvec.
///
/// Returns `None` for malformed hex.
pub fn count_set_bits(bitvec: &str) -> Option<u32> {
    let digits = bitvec.strip_prefix("0x").unwrap_or(bitvec);
    if digits.is_empty() {
        return Some(0);
    }
    let padded;
    let digits = if digits.len() % 2 == 1 {
        padded = format!("0{}", digits);
        padded.as_str()
    } else {
        digits
    };
    let bytes = hex::decode(digits).ok()?;
    Some(bytes.iter().map(|b| b.count_ones()).sum())
}
