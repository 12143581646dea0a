//! Executor: orchestration of workers over wall-clock time
//!
//! The `Executor` trait is the runtime that drives a [`Scenario`]: it decides
//! when the iteration function is invoked, by how many concurrent workers, and
//! for how long. Three executors are provided, matching the load profiles of the
//! suite:
//!
//! - [`ConstantExecutor`]: a fixed pool of workers looping with an optional
//!   think-time until the duration elapses.
//! - [`ArrivalRateExecutor`]: a token governor starts new iterations at a target
//!   rate taken from a stage table, handing each arrival to an idle pooled worker,
//!   growing the pool up to a hard maximum and dropping arrivals beyond it.
//! - [`StagedExecutor`]: a controller publishes a concurrency target taken from a
//!   stage table; workers above the target park after their current iteration.
//!
//! # Shared behaviour
//!
//! - Every worker reports through a [`VirtualUser`] into a single collector task,
//!   so samples are stored in completion order.
//! - The end of the profile is a deadline for *starting* iterations. With
//!   [`StopMode::Graceful`] (the default) in-flight iterations are allowed to finish
//!   and their samples are kept; [`StopMode::Hard`] aborts workers at the deadline.
//! - A panicking iteration is logged and counted, the worker keeps going.
//! - A profile whose total duration is zero returns an empty [`Execution`].
//!
//! # Stage interpolation
//!
//! For a stage with `start` (the previous stage's target, or the executor's
//! starting value) and `end` (this stage's target) over `duration`, the target at
//! `elapsed` is
//!
//! ```text
//! Linear: t = elapsed / duration, target(t) = start + (end - start) * t
//! Step:   target(t) = end
//! ```
//!
//! A stage with a zero duration only moves the starting point of the next stage.
pub mod arrival;
pub mod constant;
pub mod staged;

pub use arrival::ArrivalRateExecutor;
pub use constant::ConstantExecutor;
pub use staged::StagedExecutor;

use futures::{FutureExt, future::join_all};
use serde::Deserialize;
use std::{future::Future, panic::AssertUnwindSafe, time::Duration};
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    config::deserialize_duration,
    error::ConfigError,
    scenario::Scenario,
    vu::{Execution, VirtualUser},
};

/// The runtime hook that executes a `Scenario`.
///
/// Implementations must never fail once started: whatever happens to the target
/// ends up in the returned [`Execution`]. Configuration problems are reported by
/// [`Executor::validate`] before any traffic is generated.
pub trait Executor<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Reject malformed profiles up front.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Total wall-clock length of the profile.
    fn duration(&self) -> Duration;

    /// Run the scenario's iteration function according to this profile.
    fn exec(&self, scenario: &Scenario<F, Fut>) -> impl Future<Output = Execution> + Send;
}

/// What happens to in-flight iterations once the profile's duration is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    /// Start nothing new, let running iterations finish and keep their samples.
    #[default]
    Graceful,
    /// Abort every worker at the deadline.
    Hard,
}

/// How a target moves from one stage to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Ramp linearly from the previous target over the stage's duration.
    #[default]
    Linear,
    /// Jump to the stage's target at the start of the stage and hold it.
    Step,
}

/// A stage defines a target and how long it takes to get there.
///
/// The target is an arrival rate for [`ArrivalRateExecutor`] and a number of
/// concurrent workers for [`StagedExecutor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Stage {
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    pub target: u64,
}

impl Stage {
    pub fn new(duration: Duration, target: u64) -> Self {
        Self { duration, target }
    }
}

pub(crate) fn total_duration(stages: &[Stage]) -> Duration {
    stages.iter().map(|s| s.duration).sum()
}

/// Target value `elapsed` into a stage going from `start` to `end`.
pub fn interpolate(
    interpolation: Interpolation,
    elapsed: Duration,
    stage_duration: Duration,
    start: f64,
    end: f64,
) -> f64 {
    match interpolation {
        Interpolation::Step => end,
        Interpolation::Linear if stage_duration.is_zero() => end,
        Interpolation::Linear => {
            // interpolation factor [0..1]
            let t = (elapsed.as_secs_f64() / stage_duration.as_secs_f64()).min(1.0);
            start + (end - start) * t
        }
    }
}

/// Run one iteration and report its duration.
///
/// A panic inside the iteration function is contained here so the worker
/// survives it.
pub(crate) async fn run_iteration<F, Fut>(action: &F, vu: &mut VirtualUser)
where
    F: Fn(VirtualUser) -> Fut,
    Fut: Future<Output = ()>,
{
    let start = Instant::now();
    if AssertUnwindSafe(action(vu.clone())).catch_unwind().await.is_err() {
        tracing::warn!("Worker {} iteration {} panicked.", vu.id(), vu.iteration());
    }
    vu.finish_iteration(start.elapsed()).await;
}

/// Wait for every worker according to `stop`.
pub(crate) async fn finish_workers(handles: Vec<JoinHandle<()>>, deadline: Instant, stop: StopMode) {
    if stop == StopMode::Hard {
        tokio::time::sleep_until(deadline).await;
        tracing::info!("Deadline reached, aborting {} workers...", handles.len());
        handles.iter().for_each(JoinHandle::abort);
    } else {
        tracing::info!("Waiting for {} workers to drain...", handles.len());
    }

    for (i, res) in join_all(handles).await.into_iter().enumerate() {
        match res {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => tracing::debug!("Worker {i} aborted."),
            Err(e) => tracing::error!("Worker {i} panicked with error: {e}"),
        }
    }
}
