//! Command-line interface for validator-pulse.
//!
//! Provides commands for running the request processor, individual daemons
//! or the whole stack, enqueueing jobs by hand, and inspecting queue state.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
