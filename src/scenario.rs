use std::{fmt, marker::PhantomData, ops::RangeInclusive, sync::Arc};

use chrono::Utc;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::{
    dispatch::Dispatcher,
    error::ConfigError,
    executor::{Executor, StopMode},
    report::RunReport,
    sample::Sample,
    threshold::ThresholdSpec,
    vu::VirtualUser,
};

/// Decides whether a sample counts toward `http_req_failed`.
///
/// Transport failures always count. What happens to HTTP statuses is up to the
/// policy: by default anything outside `200..=399` is a failure, the same
/// expectation k6 applies. Use `FailurePolicy::expected([100..=499])` to only
/// count server errors.
#[derive(Clone)]
pub enum FailurePolicy {
    /// Only transport failures count; every status is a success.
    TransportOnly,
    /// Statuses inside any of the ranges are successes.
    Expected(Vec<RangeInclusive<u16>>),
    /// Arbitrary predicate over samples that got a response, `true` meaning failed.
    Custom(Arc<dyn Fn(&Sample) -> bool + Send + Sync>),
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Expected(vec![200..=399])
    }
}

impl fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::TransportOnly => f.write_str("TransportOnly"),
            FailurePolicy::Expected(ranges) => f.debug_tuple("Expected").field(ranges).finish(),
            FailurePolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FailurePolicy {
    pub fn expected(ranges: impl IntoIterator<Item = RangeInclusive<u16>>) -> Self {
        FailurePolicy::Expected(ranges.into_iter().collect())
    }

    pub fn custom(predicate: impl Fn(&Sample) -> bool + Send + Sync + 'static) -> Self {
        FailurePolicy::Custom(Arc::new(predicate))
    }

    pub fn is_failure(&self, sample: &Sample) -> bool {
        match (self, sample.status()) {
            (_, None) => true,
            (FailurePolicy::Custom(predicate), Some(_)) => predicate(sample),
            (FailurePolicy::TransportOnly, Some(_)) => false,
            (FailurePolicy::Expected(ranges), Some(status)) => !ranges.iter().any(|r| r.contains(&status)),
        }
    }
}

/// A named iteration function plus everything needed to judge its run.
///
/// The iteration function receives a [`VirtualUser`] and performs one or more
/// requests through it. Build the scenario once, then hand it an executor with
/// [`Scenario::run`].
#[derive(TypedBuilder)]
pub struct Scenario<F, Fut>
where
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    pub dispatcher: Dispatcher,
    #[builder(default)]
    pub thresholds: Vec<ThresholdSpec>,
    #[builder(default)]
    pub failure: FailurePolicy,
    #[builder(default)]
    pub stop: StopMode,
    #[builder(default, setter(skip))]
    future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Scenario<F, Fut>
where
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Drive the scenario with `executor` and judge the outcome.
    ///
    /// Thresholds and the profile are validated before any traffic is sent; those
    /// are the only errors. Once started, the run always completes and yields a
    /// report, whatever the target does.
    pub async fn run<E: Executor<F, Fut>>(&self, executor: &E) -> Result<RunReport, ConfigError> {
        for spec in &self.thresholds {
            spec.validate()?;
        }
        executor.validate()?;

        tracing::info!("Starting scenario: {} ({:?})", self.name, executor.duration());
        let started_at = Utc::now();
        let start = Instant::now();
        let execution = executor.exec(self).await;
        let elapsed = start.elapsed();

        let report = RunReport::new(&self.name, started_at, elapsed, execution, &self.failure, &self.thresholds)?;
        tracing::info!(
            "Scenario {} done: {} requests, {} iterations, {} dropped, thresholds {}",
            self.name,
            report.aggregates.http_reqs,
            report.aggregates.iterations,
            report.dropped_iterations,
            if report.passed() { "passed" } else { "failed" },
        );
        Ok(report)
    }
}
