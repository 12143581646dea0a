use serde::Deserialize;
use std::{future::Future, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use super::{Executor, Interpolation, Stage, constant::collect, finish_workers, interpolate, run_iteration, total_duration};
use crate::{
    config::deserialize_duration,
    error::ConfigError,
    scenario::Scenario,
    vu::{Execution, VirtualUser, spawn_collector},
};

/// A concurrency target following a stage table.
///
/// A controller recomputes the target every `tick` and publishes it to the
/// workers. Worker `i` only starts an iteration while `i < target`: when the
/// target goes down, the surplus workers finish what they are doing and park;
/// when it goes up, parked workers resume and new ones are spawned as needed.
#[derive(Debug, Clone, TypedBuilder, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedExecutor {
    /// Concurrency at the beginning of the first stage, 1 unless set.
    #[builder(default = 1)]
    #[serde(default = "one", rename = "startVUs")]
    pub start_target: u64,
    pub stages: Vec<Stage>,
    #[builder(default = Duration::from_millis(100))]
    #[serde(default = "default_tick", deserialize_with = "deserialize_duration")]
    pub tick: Duration,
    #[builder(default)]
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub think_time: Duration,
    #[builder(default)]
    #[serde(default)]
    pub interpolation: Interpolation,
}

fn one() -> u64 {
    1
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

impl<F, Fut> Executor<F, Fut> for StagedExecutor
where
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::InvalidProfile("tick must be positive".into()));
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
        let (target_tx, _) = watch::channel(0u64);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let deadline = Instant::now() + total;

        let mut current = self.start_target as f64;
        let j = self.stages.len();
        tracing::info!("Running scenario: {}!", scenario.name);
        for (i, stage) in self.stages.iter().enumerate() {
            let end = stage.target as f64;
            if stage.duration.is_zero() {
                current = end;
                continue;
            }
            tracing::info!("Starting stage: {}/{j}", i + 1);

            let stage_start = Instant::now();
            let mut next_tick = stage_start;
            loop {
                let elapsed = Instant::now().duration_since(stage_start);
                if elapsed >= stage.duration {
                    break;
                }
                next_tick += self.tick;

                let target = interpolate(self.interpolation, elapsed, stage.duration, current, end)
                    .round()
                    .max(0.0) as u64;
                target_tx.send_if_modified(|t| {
                    let changed = *t != target;
                    *t = target;
                    changed
                });

                while (handles.len() as u64) < target {
                    let id = handles.len();
                    let vu = VirtualUser::new(id, scenario.dispatcher.clone(), events.clone());
                    handles.push(tokio::spawn(worker(
                        vu,
                        scenario.action.clone(),
                        target_tx.subscribe(),
                        self.think_time,
                    )));
                }

                tokio::time::sleep_until(next_tick).await;
            }
            current = end;
            tracing::info!("Finishing stage: {}/{j}", i + 1);
        }

        // park everyone, then let parked workers notice the controller is gone
        target_tx.send_replace(0);
        drop(target_tx);
        drop(events);

        finish_workers(handles, deadline, scenario.stop).await;
        collect(collector).await
    }
}

async fn worker<F, Fut>(mut vu: VirtualUser, action: F, mut target: watch::Receiver<u64>, think_time: Duration)
where
    F: Fn(VirtualUser) -> Fut,
    Fut: Future<Output = ()>,
{
    let id = vu.id() as u64;
    tracing::debug!("Worker {id} spawned.");
    loop {
        // Err means the controller is gone and the target will never be raised again.
        if target.wait_for(|t| id < *t).await.is_err() {
            break;
        }
        run_iteration(&action, &mut vu).await;

        if !think_time.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(think_time) => {}
                _ = target.wait_for(|t| id >= *t) => {}
            }
        }
    }
    tracing::debug!("Worker {id} shutting down after {} iterations.", vu.iteration());
}
