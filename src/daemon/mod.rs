//! Daemon abstraction and runtime.
//!
//! A daemon is a periodic poller: on each cycle it fetches remote state
//! through its [`DaemonContext`], diffs it against what it saw last time and
//! enqueues jobs for what changed. [`DaemonRunner`] drives the cycles and the
//! response listener.

pub mod context;
pub mod runner;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DaemonError;

pub use context::{DaemonContext, Transport};
pub use runner::{DaemonRunner, RunnerStats};

/// A periodic poller.
#[async_trait]
pub trait Daemon: Send {
    /// Class name, also the owner of `response_queue:<name>`.
    fn name(&self) -> &'static str;

    /// Time between cycle starts.
    fn interval(&self) -> Duration;

    /// Runs one poll cycle.
    ///
    /// # Returns
    ///
    /// The number of jobs enqueued.
    async fn run(&mut self, ctx: &DaemonContext) -> Result<usize, DaemonError>;
}
