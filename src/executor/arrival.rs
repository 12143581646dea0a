//! The `ArrivalRateExecutor` and its components: an open-model executor that
//! starts iterations at a target rate regardless of how long they take.
//!
//! # High-level flow
//! 1. `pre_allocated` workers are spawned and registered as idle.
//! 2. The governor loop walks the stage table. Every `tick` it computes how many
//!    iterations should start during that tick (see [`calc_arrivals`]).
//! 3. Each arrival is handed to the pool:
//!    - if a worker is idle, it is claimed and a permit is added to the token
//!      semaphore; exactly one idle worker wakes up and runs one iteration;
//!    - otherwise, if the pool is below `max_workers`, a new worker is spawned
//!      with that arrival as its first iteration;
//!    - otherwise the arrival is dropped and counted in
//!      [`Execution::dropped_iterations`]. Drops measure the generator's own
//!      saturation and are never mixed into the target's error rate.
//! 4. When the stage table is exhausted the governor broadcasts shutdown; idle
//!    workers exit, busy ones finish their iteration first.
//!
//! The governor is the only task that spawns workers, so the pool size can never
//! exceed `max_workers`. Workers only ever add themselves back to the idle count
//! after an iteration, and a permit is only added for an already claimed idle
//! worker, so one worker never runs two iterations at once.
//!
//! # Mathematical behavior of the governor
//! With the rate interpolated as described in [`super`], the number of arrivals
//! to start in a tick of length `tick` is
//!
//! ```text
//! add_f = r(t) * tick_seconds
//! add_total = floor(add_f + fractional)
//! fractional = (add_f + fractional) - add_total
//! ```
//!
//! Carrying the fractional part keeps the long-term average exact even when a
//! single tick is worth less than one arrival.

use serde::Deserialize;
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{
        Semaphore,
        watch::{self, Receiver, Sender},
    },
    task::JoinHandle,
    time::Instant,
};
use typed_builder::TypedBuilder;

use super::{Executor, Interpolation, Stage, constant::collect, finish_workers, interpolate, run_iteration, total_duration};
use crate::{
    config::deserialize_duration,
    error::ConfigError,
    scenario::Scenario,
    vu::{Event, Execution, VirtualUser, spawn_collector},
};

/// The semaphore implementation uses 3 bits of usize for flags.
/// Any value greater than this will be capped to avoid crashing
/// the whole thing.
const MAX_TOKENS: usize = usize::MAX >> 3;

/// Starts `rate(t)` iterations per `time_unit`, following a stage table.
///
/// # Tuning knobs
///
/// - `tick`: granularity of governor updates. Smaller ticks (e.g. 10ms) give
///   smoother arrivals at the cost of more wakeups.
/// - `pre_allocated`: workers spawned before the run starts.
/// - `max_workers`: hard ceiling on the pool. When every worker is busy and the
///   ceiling is reached, further arrivals are dropped.
#[derive(Debug, Clone, TypedBuilder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalRateExecutor {
    /// Rate at the beginning of the first stage.
    #[builder(default)]
    #[serde(default)]
    pub start_rate: u64,
    /// Period the rates are expressed in.
    #[builder(default = Duration::from_secs(1))]
    #[serde(default = "one_second", deserialize_with = "deserialize_duration")]
    pub time_unit: Duration,
    pub stages: Vec<Stage>,
    #[serde(rename = "preAllocatedVUs")]
    pub pre_allocated: usize,
    #[serde(rename = "maxVUs")]
    pub max_workers: usize,
    #[builder(default = Duration::from_millis(100))]
    #[serde(default = "default_tick", deserialize_with = "deserialize_duration")]
    pub tick: Duration,
    #[builder(default)]
    #[serde(default)]
    pub interpolation: Interpolation,
}

fn one_second() -> Duration {
    Duration::from_secs(1)
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

impl<F, Fut> Executor<F, Fut> for ArrivalRateExecutor
where
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn validate(&self) -> Result<(), ConfigError> {
        if self.time_unit.is_zero() {
            return Err(ConfigError::InvalidProfile("timeUnit must be positive".into()));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::InvalidProfile("tick must be positive".into()));
        }
        if self.max_workers < self.pre_allocated {
            return Err(ConfigError::InvalidProfile(format!(
                "maxVUs ({}) is lower than preAllocatedVUs ({})",
                self.max_workers, self.pre_allocated
            )));
        }
        Ok(())
    }

    fn duration(&self) -> Duration {
        total_duration(&self.stages)
    }

    async fn exec(&self, scenario: &Scenario<F, Fut>) -> Execution {
        let total = total_duration(&self.stages);
        if total.is_zero() {
            tracing::info!("Nothing to run for scenario: {}", scenario.name);
            return Execution::default();
        }

        let (events, collector) = spawn_collector();
        let (ctx, shutdown_tx) = ExecutionContext::new(self.pre_allocated);
        let mut pool = WorkerPool {
            ctx,
            action: scenario.action.clone(),
            dispatcher: scenario.dispatcher.clone(),
            events,
            handles: Vec::with_capacity(self.pre_allocated),
            max_workers: self.max_workers,
        };

        tracing::info!("Spawning {} pre-allocated workers...", self.pre_allocated);
        for _ in 0..self.pre_allocated {
            pool.spawn(false);
        }

        let deadline = Instant::now() + total;
        tracing::info!("Running scenario: {}!", scenario.name);
        let dropped = token_governor(&mut pool, self).await;

        tracing::info!("Governor finished, signaling shutdown...");
        let _ = shutdown_tx.send(true);

        let WorkerPool { handles, events, .. } = pool;
        drop(events);
        if dropped > 0 {
            tracing::warn!("{dropped} arrivals dropped: worker pool saturated.");
        }
        finish_workers(handles, deadline, scenario.stop).await;

        let mut execution = collect(collector).await;
        execution.dropped_iterations = dropped;
        execution
    }
}

/// Walk the stages, starting iterations tick by tick. Returns the dropped count.
async fn token_governor<F, Fut>(pool: &mut WorkerPool<F>, cfg: &ArrivalRateExecutor) -> u64
where
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    // rates are per time unit, the governor works per second
    let per_second = 1.0 / cfg.time_unit.as_secs_f64();
    let mut rate = cfg.start_rate as f64 * per_second;
    let mut fractional = 0.0;
    let mut dropped = 0;

    let j = cfg.stages.len();
    for (i, stage) in cfg.stages.iter().enumerate() {
        let end_rate = stage.target as f64 * per_second;
        // Instantly jump to target rate.
        // This allows handling spikes or starting at a non-zero rate.
        if stage.duration.is_zero() {
            rate = end_rate;
            continue;
        }
        tracing::info!("Starting stage: {}/{j}", i + 1);

        let stage_start = Instant::now();
        let mut next_tick = stage_start;
        let start_rate = rate;

        loop {
            let elapsed = Instant::now().duration_since(stage_start);
            if elapsed >= stage.duration {
                break;
            }
            next_tick += cfg.tick;

            let (arrivals, f) = calc_arrivals(
                cfg.interpolation,
                elapsed,
                stage.duration,
                start_rate,
                end_rate,
                fractional,
                cfg.tick,
            );
            fractional = f;
            dropped += pool.offer(arrivals);

            tokio::time::sleep_until(next_tick).await;
        }
        // Ensure the rate for the *next* stage starts from the
        // exact target of *this* stage, preventing rounding errors.
        rate = end_rate;
        tracing::info!("Finishing stage: {}/{j}", i + 1);
    }
    dropped
}

/// Pure function to calculate the number of arrivals for this tick.
///
/// It interpolates the rate and carries any fractional arrival over to the
/// next tick to maintain the long-term average rate.
///
/// Returns `(arrivals, next_fractional_part)`.
pub fn calc_arrivals(
    interpolation: Interpolation,
    elapsed: Duration,
    stage_duration: Duration,
    start_rate: f64,
    end_rate: f64,
    fractional: f64,
    tick: Duration,
) -> (usize, f64) {
    let tick_rate = interpolate(interpolation, elapsed, stage_duration, start_rate, end_rate);
    // Arrivals to start this tick (as a float)
    let add_f = tick_rate * tick.as_secs_f64();

    let add_total_f = (add_f + fractional).floor();
    let fractional = (add_f + fractional) - add_total_f;

    // Saturate instead of panicking on absurd rates.
    let add_total = if add_total_f >= (MAX_TOKENS as f64) {
        MAX_TOKENS
    } else if add_total_f < 0.0 {
        0
    } else {
        add_total_f as usize
    };

    (add_total, fractional)
}

/// Shared state between the governor and pooled workers.
#[derive(Clone)]
pub(crate) struct ExecutionContext {
    /// Broadcasts the signal to stop all workers.
    pub shutdown: Receiver<bool>,
    /// One permit per arrival handed to an already claimed idle worker.
    pub tokens: Arc<Semaphore>,
    /// Workers waiting for an arrival and not yet claimed.
    pub idle: Arc<AtomicUsize>,
}

impl ExecutionContext {
    pub fn new(idle: usize) -> (Self, Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                shutdown: rx,
                tokens: Arc::new(Semaphore::new(0)),
                idle: Arc::new(AtomicUsize::new(idle)),
            },
            tx,
        )
    }

    /// Claim up to `wanted` idle workers, returning how many were claimed.
    pub fn claim_idle(&self, wanted: usize) -> usize {
        self.idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| Some(idle - idle.min(wanted)))
            .map(|previous| previous.min(wanted))
            .unwrap_or(0)
    }
}

/// The worker pool, owned by the governor.
struct WorkerPool<F> {
    ctx: ExecutionContext,
    action: F,
    dispatcher: crate::Dispatcher,
    events: tokio::sync::mpsc::Sender<Event>,
    handles: Vec<JoinHandle<()>>,
    max_workers: usize,
}

impl<F, Fut> WorkerPool<F>
where
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Hand `arrivals` iterations to the pool. Returns how many were dropped.
    fn offer(&mut self, arrivals: usize) -> u64 {
        if arrivals == 0 {
            return 0;
        }

        let claimed = self.ctx.claim_idle(arrivals);
        if claimed > 0 {
            self.ctx.tokens.add_permits(claimed);
        }

        let mut remaining = arrivals - claimed;
        while remaining > 0 && self.handles.len() < self.max_workers {
            self.spawn(true);
            remaining -= 1;
        }

        if remaining > 0 {
            tracing::debug!("Pool saturated at {} workers, dropping {remaining} arrivals.", self.handles.len());
        }
        remaining as u64
    }

    /// Spawn a worker. With `assigned`, it starts on an arrival right away
    /// instead of registering as idle.
    fn spawn(&mut self, assigned: bool) {
        let id = self.handles.len();
        let mut ctx = self.ctx.clone();
        let action = self.action.clone();
        let mut vu = VirtualUser::new(id, self.dispatcher.clone(), self.events.clone());

        self.handles.push(tokio::spawn(async move {
            tracing::debug!("Worker {id} spawned.");
            let mut has_work = assigned;
            loop {
                if !has_work {
                    tokio::select! {
                        biased;
                        permit = ctx.tokens.acquire() => match permit {
                            // The governor is solely responsible for adding permits.
                            Ok(p) => p.forget(),
                            Err(_) => break,
                        },
                        _ = ctx.shutdown.wait_for(|b| *b) => break,
                    }
                }
                has_work = false;

                run_iteration(&action, &mut vu).await;
                ctx.idle.fetch_add(1, Ordering::AcqRel);
            }
            tracing::debug!("Worker {id} shutting down after {} iterations.", vu.iteration());
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dispatcher, HarnessConfig, Sample, executor::StopMode};
    use std::sync::atomic::AtomicUsize;

    fn scenario<F, Fut>(action: F) -> Scenario<F, Fut>
    where
        F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Scenario::builder()
            .name("arrival")
            .action(action)
            .dispatcher(Dispatcher::new(HarnessConfig::default()).unwrap())
            .build()
    }

    mod calc_arrivals {
        use super::*;

        fn linear(elapsed: Duration, start: f64, end: f64, fractional: f64) -> (usize, f64) {
            calc_arrivals(
                Interpolation::Linear,
                elapsed,
                Duration::from_secs(10),
                start,
                end,
                fractional,
                Duration::from_millis(100),
            )
        }

        #[test]
        fn linearity() {
            let mut end_rate = 100.;
            let mut expected_t = 1;
            for _ in 0..10 {
                let (t, f) = linear(Duration::from_secs(1), 0., end_rate, 0.);

                assert_eq!(t, expected_t);
                // as they are always powers of 10 there should never be a fractional carry
                assert_eq!(f, 0.);

                end_rate *= 10.;
                expected_t *= 10;
            }
        }

        #[test]
        fn fractional_accumulation() {
            let mut facc = 0.;
            let expected_fs = [0.25, 0.5, 0.75, 0.];

            for i in 0..10 {
                let (t, f) = linear(Duration::from_secs(1), 12.5, 12.5, facc);
                facc = f;

                let expected_f = expected_fs[i % 4];
                let expected_t = if expected_f == 0. { 2 } else { 1 };
                assert_eq!(t, expected_t);
                assert_eq!(f, expected_f)
            }
        }

        #[test]
        fn ramp_down() {
            for i in 0..10 {
                let (t, f) = linear(Duration::from_secs(i), 100., 0., 0.);
                assert_eq!(t, (10 - i) as usize);
                assert_eq!(f, 0.0);
            }
            let (t_end, f_end) = linear(Duration::from_secs(10), 100., 0., 0.);
            assert_eq!(t_end, 0);
            assert_eq!(f_end, 0.0);
        }

        #[test]
        fn step_holds_target_for_whole_stage() {
            for i in 0..10 {
                let (t, _) = calc_arrivals(
                    Interpolation::Step,
                    Duration::from_secs(i),
                    Duration::from_secs(10),
                    0.,
                    100.,
                    0.,
                    Duration::from_millis(100),
                );
                assert_eq!(t, 10);
            }
        }

        #[test]
        fn negative_value_returns_0() {
            let (t, f) = linear(Duration::from_secs(1), -100., -100., 0.);
            assert_eq!(t, 0);
            assert_eq!(f, 0.0);
        }

        #[test]
        fn extreme_rate_cap_at_max_tokens() {
            let (t, f) = calc_arrivals(
                Interpolation::Linear,
                Duration::from_secs(1),
                Duration::from_secs(1),
                f64::MAX,
                f64::MAX,
                0.,
                Duration::from_secs(1),
            );
            assert_eq!(t, MAX_TOKENS);
            assert_eq!(f, 0.);
        }
    }

    #[test]
    fn claim_idle_never_goes_below_zero() {
        let (ctx, _tx) = ExecutionContext::new(3);
        assert_eq!(ctx.claim_idle(2), 2);
        assert_eq!(ctx.claim_idle(5), 1);
        assert_eq!(ctx.claim_idle(1), 0);
        assert_eq!(ctx.idle.load(Ordering::Acquire), 0);
    }

    #[test]
    fn rejects_pool_smaller_than_preallocation() {
        let executor = ArrivalRateExecutor::builder()
            .stages(vec![Stage::new(Duration::from_secs(1), 10)])
            .pre_allocated(10)
            .max_workers(5)
            .build();
        type Noop = futures::future::Ready<()>;
        let res = <ArrivalRateExecutor as Executor<fn(VirtualUser) -> Noop, Noop>>::validate(&executor);
        assert!(matches!(res, Err(ConfigError::InvalidProfile(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_drops_arrivals_without_touching_samples() {
        let executor = ArrivalRateExecutor::builder()
            .start_rate(100)
            .stages(vec![Stage::new(Duration::from_secs(1), 100)])
            .pre_allocated(1)
            .max_workers(1)
            .build();
        let slow_ok = |vu: VirtualUser| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            vu.record(Sample::response("POST", "http://t", Duration::from_millis(500), 200, "[]"))
                .await;
        };

        let execution = executor.exec(&scenario(slow_ok)).await;

        assert!(execution.dropped_iterations > 0);
        assert!(!execution.samples.is_empty());
        assert!(execution.samples.iter().all(|s| s.status() == Some(200)));
        // every offered arrival either ran or was dropped
        assert_eq!(execution.samples.len() as u64 + execution.dropped_iterations, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_grows_up_to_max_and_never_beyond() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let action = {
            let (running, peak) = (running.clone(), peak.clone());
            move |vu: VirtualUser| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    vu.record(Sample::response("GET", "http://t", Duration::from_secs(1), 200, ""))
                        .await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }
        };
        // one arrival per tick for ten ticks, each iteration lasts the whole run
        let executor = ArrivalRateExecutor::builder()
            .start_rate(10)
            .stages(vec![Stage::new(Duration::from_secs(1), 10)])
            .pre_allocated(1)
            .max_workers(5)
            .build();

        let execution = executor.exec(&scenario(action)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 5);
        assert_eq!(execution.samples.len(), 5);
        assert_eq!(execution.dropped_iterations, 5);
    }

    /// Ten arrivals, one every 100ms, each lasting 250ms: the ones started at
    /// 800 and 900ms are still running when the stage table ends at 1s.
    async fn run_with(stop: StopMode) -> (Execution, Duration) {
        let slow = |vu: VirtualUser| async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            vu.record(Sample::response("POST", "http://t", Duration::from_millis(250), 201, ""))
                .await;
        };
        let scenario = Scenario::builder()
            .name("arrival-stop")
            .action(slow)
            .dispatcher(Dispatcher::new(HarnessConfig::default()).unwrap())
            .stop(stop)
            .build();
        let executor = ArrivalRateExecutor::builder()
            .start_rate(10)
            .stages(vec![Stage::new(Duration::from_secs(1), 10)])
            .pre_allocated(10)
            .max_workers(10)
            .build();

        let start = Instant::now();
        let execution = executor.exec(&scenario).await;
        (execution, start.elapsed())
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_reports_in_flight_arrivals() {
        let (execution, elapsed) = run_with(StopMode::Graceful).await;
        assert_eq!(execution.samples.len(), 10);
        assert_eq!(execution.dropped_iterations, 0);
        assert_eq!(elapsed, Duration::from_millis(1150));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_stop_cuts_in_flight_arrivals_at_the_deadline() {
        let (execution, elapsed) = run_with(StopMode::Hard).await;
        assert_eq!(execution.samples.len(), 8);
        assert_eq!(execution.iteration_durations.len(), 8);
        assert_eq!(elapsed, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_length_stages_run_nothing() {
        let executor = ArrivalRateExecutor::builder()
            .stages(vec![Stage::new(Duration::ZERO, 50)])
            .pre_allocated(2)
            .max_workers(2)
            .build();
        let execution = executor.exec(&scenario(|_vu: VirtualUser| async {})).await;
        assert!(execution.samples.is_empty());
        assert!(execution.iteration_durations.is_empty());
        assert_eq!(execution.dropped_iterations, 0);
    }
}
