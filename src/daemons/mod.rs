//! Concrete daemons polling the Aptos fullnode and CoinGecko.
//!
//! | Daemon | Interval | Jobs |
//! |---|---|---|
//! | `LedgerInfoDaemon` | 30 s | `LedgerInfoJob` |
//! | `ValidatorsDaemon` | 5 min | `ValidatorSnapshotJob` |
//! | `ValidatorPerformanceDaemon` | 60 s | `ValidatorPerformanceJob` |
//! | `EpochHistoryDaemon` | 2 min | `EpochHistoryJob` |
//! | `BlockProposalsDaemon` | 60 s | `BlockProposalJob` |
//! | `ValidatorVotesDaemon` | 60 s | `ValidatorVoteJob` |
//! | `StakeHistoryDaemon` | 15 min | `StakeRewardJob` |
//! | `CoinGeckoPriceDaemon` | 5 min | `CoinPriceJob` |

pub mod aptos;
pub mod block_proposals;
pub mod coingecko_price;
pub mod epoch_history;
pub mod ledger_info;
pub mod stake_history;
pub mod validator_performance;
pub mod validator_votes;
pub mod validators;

use crate::daemon::Daemon;
use crate::error::DaemonError;

pub use block_proposals::BlockProposalsDaemon;
pub use coingecko_price::CoinGeckoPriceDaemon;
pub use epoch_history::EpochHistoryDaemon;
pub use ledger_info::LedgerInfoDaemon;
pub use stake_history::StakeHistoryDaemon;
pub use validator_performance::ValidatorPerformanceDaemon;
pub use validator_votes::ValidatorVotesDaemon;
pub use validators::ValidatorsDaemon;

/// Class names of every daemon.
pub const DAEMON_NAMES: [&str; 8] = [
    "LedgerInfoDaemon",
    "ValidatorsDaemon",
    "ValidatorPerformanceDaemon",
    "EpochHistoryDaemon",
    "BlockProposalsDaemon",
    "ValidatorVotesDaemon",
    "StakeHistoryDaemon",
    "CoinGeckoPriceDaemon",
];

/// Lowercase name without separators or a trailing "daemon".
fn normalize(name: &str) -> String {
    let flat: String = name
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect();
    flat.strip_suffix("daemon").map(str::to_string).unwrap_or(flat)
}

/// Creates a daemon by class name (`LedgerInfoDaemon`) or short name
/// (`ledger-info`, `ledger_info`).
pub fn create_daemon(name: &str) -> Result<Box<dyn Daemon>, DaemonError> {
    let daemon: Box<dyn Daemon> = match normalize(name).as_str() {
        "ledgerinfo" => Box::new(LedgerInfoDaemon::new()),
        "validators" => Box::new(ValidatorsDaemon::new()),
        "validatorperformance" => Box::new(ValidatorPerformanceDaemon::new()),
        "epochhistory" => Box::new(EpochHistoryDaemon::new()),
        "blockproposals" => Box::new(BlockProposalsDaemon::new()),
        "validatorvotes" => Box::new(ValidatorVotesDaemon::new()),
        "stakehistory" => Box::new(StakeHistoryDaemon::new()),
        "coingeckoprice" => Box::new(CoinGeckoPriceDaemon::new()),
        _ => return Err(DaemonError::UnknownDaemon(name.to_string())),
    };
    Ok(daemon)
}

/// One instance of every daemon.
pub fn all_daemons() -> Vec<Box<dyn Daemon>> {
    DAEMON_NAMES
        .iter()
        .filter_map(|name| create_daemon(name).ok())
        .collect()
}
