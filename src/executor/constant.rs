use serde::Deserialize;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{Executor, finish_workers, run_iteration};
use crate::{
    config::deserialize_duration,
    scenario::Scenario,
    vu::{Execution, VirtualUser, spawn_collector},
};

/// A fixed pool of workers, each looping independently until `duration` elapses.
///
/// Every worker runs the iteration function, idles for `think_time`, and starts
/// again as long as the deadline has not passed. The deadline only prevents new
/// iterations from starting; see [`super::StopMode`].
#[derive(Debug, Clone, TypedBuilder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstantExecutor {
    /// Number of concurrent workers.
    #[serde(rename = "vus")]
    pub workers: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    /// Idle time between two iterations of the same worker.
    #[builder(default)]
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub think_time: Duration,
}

impl<F, Fut> Executor<F, Fut> for ConstantExecutor
where
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn duration(&self) -> Duration {
        self.duration
    }

    async fn exec(&self, scenario: &Scenario<F, Fut>) -> Execution {
        if self.workers == 0 || self.duration.is_zero() {
            tracing::info!("Nothing to run for scenario: {}", scenario.name);
            return Execution::default();
        }

        let (events, collector) = spawn_collector();
        let deadline = Instant::now() + self.duration;
        let think_time = self.think_time;

        tracing::info!("Spawning {} workers...", self.workers);
        let handles = (0..self.workers)
            .map(|id| {
                let action = scenario.action.clone();
                let mut vu = VirtualUser::new(id, scenario.dispatcher.clone(), events.clone());
                tokio::spawn(async move {
                    tracing::debug!("Worker {id} started.");
                    while Instant::now() < deadline {
                        run_iteration(&action, &mut vu).await;
                        if !think_time.is_zero() {
                            tokio::time::sleep_until((Instant::now() + think_time).min(deadline)).await;
                        }
                    }
                    tracing::debug!("Worker {id} shutting down after {} iterations.", vu.iteration());
                })
            })
            .collect();
        drop(events);

        finish_workers(handles, deadline, scenario.stop).await;
        collect(collector).await
    }
}

/// Await the collector; a collector that died yields an empty execution.
pub(crate) async fn collect(collector: tokio::task::JoinHandle<Execution>) -> Execution {
    match collector.await {
        Ok(execution) => execution,
        Err(e) => {
            tracing::error!("Collector task failed: {e}");
            Execution::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dispatcher, HarnessConfig, Sample, executor::StopMode};

    fn scenario<F, Fut>(action: F, stop: StopMode) -> Scenario<F, Fut>
    where
        F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Scenario::builder()
            .name("constant")
            .action(action)
            .dispatcher(Dispatcher::new(HarnessConfig::default()).unwrap())
            .stop(stop)
            .build()
    }

    async fn fifty_ms_ok(vu: VirtualUser) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        vu.record(Sample::response("GET", "http://t/ok", Duration::from_millis(50), 200, ""))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_worker_runs_until_deadline() {
        let executor = ConstantExecutor::builder()
            .workers(1)
            .duration(Duration::from_millis(120))
            .build();
        let execution = executor.exec(&scenario(fifty_ms_ok, StopMode::Graceful)).await;

        // iterations start at 0, 50 and 100ms
        assert_eq!(execution.samples.len(), 3);
        assert_eq!(execution.iteration_durations, [Duration::from_millis(50); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_runs_nothing() {
        let executor = ConstantExecutor::builder()
            .workers(4)
            .duration(Duration::ZERO)
            .build();
        let execution = executor.exec(&scenario(fifty_ms_ok, StopMode::Graceful)).await;
        assert!(execution.samples.is_empty());
        assert!(execution.iteration_durations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_keeps_in_flight_iterations() {
        let slow = |vu: VirtualUser| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            vu.record(Sample::response("GET", "http://t/slow", Duration::from_millis(100), 200, ""))
                .await;
        };
        let executor = ConstantExecutor::builder()
            .workers(2)
            .duration(Duration::from_millis(150))
            .build();
        let start = Instant::now();
        let execution = executor.exec(&scenario(slow, StopMode::Graceful)).await;

        // two iterations per worker: the second pair was in flight at the deadline
        assert_eq!(execution.samples.len(), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_stop_aborts_in_flight_iterations() {
        let slow = |vu: VirtualUser| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            vu.record(Sample::response("GET", "http://t/slow", Duration::from_millis(100), 200, ""))
                .await;
        };
        let executor = ConstantExecutor::builder()
            .workers(2)
            .duration(Duration::from_millis(150))
            .build();
        let execution = executor.exec(&scenario(slow, StopMode::Hard)).await;
        assert_eq!(execution.samples.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn think_time_spaces_iterations() {
        let executor = ConstantExecutor::builder()
            .workers(1)
            .duration(Duration::from_millis(500))
            .think_time(Duration::from_millis(200))
            .build();
        let execution = executor.exec(&scenario(fifty_ms_ok, StopMode::Graceful)).await;
        // iterations start at 0, 250 and 500 is already past the deadline
        assert_eq!(execution.samples.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_iteration_does_not_kill_the_worker() {
        let flaky = |vu: VirtualUser| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if vu.iteration() == 0 {
                panic!("first iteration explodes");
            }
            vu.record(Sample::response("GET", "http://t", Duration::from_millis(10), 200, ""))
                .await;
        };
        let executor = ConstantExecutor::builder()
            .workers(1)
            .duration(Duration::from_millis(30))
            .build();
        let execution = executor.exec(&scenario(flaky, StopMode::Graceful)).await;
        assert_eq!(execution.iteration_durations.len(), 3);
        assert_eq!(execution.samples.len(), 2);
    }
}
