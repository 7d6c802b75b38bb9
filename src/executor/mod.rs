//! Executor — scheduling of virtual users over time
//!
//! The `Executor` trait is the runtime hook that executes a `Scenario`. An executor owns
//! the traffic profile: how many virtual users run at any instant, for how long, and how
//! the run ends. Everything else (recording, checks, thresholds) goes through the
//! scenario's [`Registry`](crate::registry::Registry), so executors are replaceable.
//!
//! The [`StageExecutor`] drives a pool of virtual users through a list of [`Stage`]s. Each
//! stage names a target number of concurrent virtual users and how long to take getting
//! there from the previous target. A scheduler loop wakes up every `tick`, computes the
//! target for the current instant and reconciles the pool against it.
//!
//! # High-level flow
//! 1. Validate the stages and register the built-in metrics the executor writes to.
//! 2. Every `tick`:
//!    - compute `concurrency_at(elapsed)`,
//!    - retire the most recently started workers while there are too many,
//!    - spawn fresh workers while `live < target` (live counts retired workers that are
//!      still finishing their last iteration),
//!    - sample the number of active workers into the `vus` trend.
//! 3. Each worker repeatedly runs one iteration through the
//!    [`IterationRunner`](crate::runner::IterationRunner), then sleeps for `sleep`. A
//!    retired worker finishes the iteration it is in, and its sleep is cut short.
//! 4. When the stages are over (or the abort future given to
//!    [`StageExecutor::exec_until`] resolves) every worker is signalled through a watch
//!    channel, the executor waits for in-flight iterations (bounded by `graceful_stop`),
//!    freezes the registry and snapshots it.
//!
//! # Mathematical behavior of the ramp
//! For a stage with `from` (previous target, 0 for the first stage) and `to`
//! (`stage.target`) over `duration`, at time `elapsed` into the stage:
//!
//! ```text
//! t = elapsed / duration
//! vus(t) = floor(from + (to - from) * t)
//! ```
//!
//! With [`Ramp::Step`] the target of the current stage applies for its whole duration.
//! A zero-length stage is an instant jump: the next stage starts from its target.
//!
//! # Notes about correctness
//! - Concurrency never exceeds the largest stage target: new workers are only started
//!   while the live count is below the current target.
//! - Iterations are never cancelled by scale-down. Only `graceful_stop` at the end of the
//!   run aborts stragglers, and those are reported in a warning.
//! - A failed or panicking iteration is recorded and the worker carries on.
pub mod constant;
pub mod stage;
pub use constant::ConstantExecutor;
pub use stage::{Ramp, Stage, StageExecutor, concurrency_at, max_target, total_duration};

use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};
use thiserror::Error;

use crate::{
    error::IterationResult,
    registry::{RegistryError, RegistrySnapshot},
    scenario::Scenario,
};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("at least one stage is required")]
    NoStages,
    #[error("scheduler tick must be greater than zero")]
    ZeroTick,
    #[error("scenario `{0}` already ran, its registry is frozen")]
    AlreadyRan(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Raw outcome of one run, before thresholds are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub snapshot: RegistrySnapshot,
    pub elapsed: Duration,
    pub peak_vus: usize,
    /// The run was cut short by its abort future.
    pub aborted: bool,
}

pub trait Executor<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn() -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    /// Execute the scenario and return its frozen metrics.
    fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
    ) -> impl Future<Output = Result<RunResult, Self::Error>> + Send;
}
