//! Core library behind the `conveyor` CLI: the tick-driven
//! orchestrator for the catalog synchronization pipeline.
//!
//! [`orchestrator::tick`] is the one thing an external caller (the CLI, a
//! cron wrapper, a test) ever needs to call. Everything else in this crate
//! — the lock/state/retry primitives live in their own crates; this crate
//! owns the step runners (`steps`) and the loop that drives them.

pub mod orchestrator;
pub mod reporter;
pub mod sources;
pub mod steps;

pub use orchestrator::{TickDeps, find_running_run, run_to_completion, start_new_run, tick};
pub use reporter::{NullReporter, Reporter, VecReporter};
pub use sources::{FeedError, FeedSource, LocalFeedSource};
