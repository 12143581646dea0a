//! Metrics aggregator: a pure reduction of a run's recorded events.
//!
//! [`Aggregates::compute`] takes the samples, iteration durations and checks
//! collected by an executor and produces the k6-style metric table the
//! thresholds are evaluated against:
//!
//! | metric               | kind    |
//! |----------------------|---------|
//! | `http_reqs`          | counter |
//! | `http_req_failed`    | rate    |
//! | `http_req_duration`  | trend   |
//! | `iterations`         | counter |
//! | `iteration_duration` | trend   |
//! | `dropped_iterations` | counter |
//! | `checks`             | rate    |
//!
//! Counters also answer `rate` the way k6 does, as events per second over the
//! run's elapsed time, which is passed in rather than measured. Nothing here
//! looks at the clock: the same input always yields the same table.

use serde::{Serialize, Serializer, ser::SerializeStruct};
use std::{collections::BTreeMap, time::Duration};

use crate::{
    sample::{Sample, millis},
    scenario::FailurePolicy,
    threshold::Aggregation,
    vu::CheckOutcome,
};

/// Kind of a built-in metric, which decides the aggregations it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

impl MetricKind {
    pub fn supports(self, aggregation: &Aggregation) -> bool {
        match self {
            MetricKind::Counter => matches!(aggregation, Aggregation::Count | Aggregation::Rate),
            MetricKind::Rate => matches!(aggregation, Aggregation::Rate),
            MetricKind::Trend => !matches!(aggregation, Aggregation::Count | Aggregation::Rate),
        }
    }
}

/// Look up a built-in metric by name.
pub fn metric_kind(name: &str) -> Option<MetricKind> {
    match name {
        "http_reqs" | "iterations" | "dropped_iterations" => Some(MetricKind::Counter),
        "http_req_failed" | "checks" => Some(MetricKind::Rate),
        "http_req_duration" | "iteration_duration" => Some(MetricKind::Trend),
        _ => None,
    }
}

/// Ratio of hits over total. An empty rate is `0`, never `NaN`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rate {
    pub hits: u64,
    pub total: u64,
}

impl Rate {
    pub fn add(&mut self, hit: bool) {
        self.total += 1;
        if hit {
            self.hits += 1;
        }
    }

    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.hits as f64 / self.total as f64
        }
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut state = s.serialize_struct("Rate", 3)?;
        state.serialize_field("rate", &self.value())?;
        state.serialize_field("passes", &self.hits)?;
        state.serialize_field("fails", &(self.total - self.hits))?;
        state.end()
    }
}

const RANK_EPSILON: f64 = 1e-9;

/// A sorted series of values in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trend {
    sorted: Vec<f64>,
}

impl Trend {
    pub fn from_millis(mut values: Vec<f64>) -> Self {
        values.sort_by(f64::total_cmp);
        Self { sorted: values }
    }

    pub fn from_durations<'a>(durations: impl IntoIterator<Item = &'a Duration>) -> Self {
        Self::from_millis(
            durations
                .into_iter()
                .map(|d| d.as_nanos() as f64 / 1e6)
                .collect(),
        )
    }

    pub fn count(&self) -> usize {
        self.sorted.len()
    }

    pub fn min(&self) -> Option<f64> {
        self.sorted.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.sorted.last().copied()
    }

    pub fn avg(&self) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        Some(self.sorted.iter().sum::<f64>() / self.sorted.len() as f64)
    }

    pub fn med(&self) -> Option<f64> {
        self.p(50.0)
    }

    /// Nearest rank on the zero-indexed sorted series: `sorted[floor(p * (n - 1))]`.
    ///
    /// `p` is a fraction in `[0, 1]` and is clamped into it. No interpolation is
    /// done between neighbours. `None` when the trend is empty.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.p(p * 100.0)
    }

    /// Same as [`Trend::percentile`] with `percent` in `[0, 100]`, as in `p(95)`.
    pub fn p(&self, percent: f64) -> Option<f64> {
        let last = self.sorted.len().checked_sub(1)?;
        let position = percent.clamp(0.0, 100.0) * last as f64 / 100.0;
        // positions within RANK_EPSILON below a rank are that rank: 0.29 is
        // stored as 0.28999.. and must still land on index 29 of 101 values
        let idx = (position + RANK_EPSILON).floor() as usize;
        self.sorted.get(idx.min(last)).copied()
    }

    pub fn stats(&self) -> TrendStats {
        TrendStats {
            count: self.count(),
            min: self.min(),
            max: self.max(),
            avg: self.avg(),
            med: self.med(),
            p90: self.p(90.0),
            p95: self.p(95.0),
            p99: self.p(99.0),
        }
    }
}

impl Serialize for Trend {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.stats().serialize(s)
    }
}

/// Summary of a [`Trend`], as shown in reports. Values are milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendStats {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Every metric of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregates {
    pub http_reqs: u64,
    pub http_req_failed: Rate,
    pub http_req_duration: Trend,
    pub iterations: u64,
    pub iteration_duration: Trend,
    /// Arrivals the generator could not start. Never part of `http_req_failed`.
    pub dropped_iterations: u64,
    pub checks: Rate,
    /// Pass rate of each named check.
    pub check_breakdown: BTreeMap<String, Rate>,
    /// Span the counters are divided by for their per-second `rate`.
    #[serde(rename = "elapsed_ms", serialize_with = "millis::serialize")]
    pub elapsed: Duration,
}

impl Aggregates {
    pub fn compute(
        samples: &[Sample],
        iteration_durations: &[Duration],
        checks: &[CheckOutcome],
        dropped_iterations: u64,
        elapsed: Duration,
        failure: &FailurePolicy,
    ) -> Self {
        let mut http_req_failed = Rate::default();
        for sample in samples {
            http_req_failed.add(failure.is_failure(sample));
        }

        let mut all_checks = Rate::default();
        let mut check_breakdown = BTreeMap::<String, Rate>::new();
        for check in checks {
            all_checks.add(check.passed);
            check_breakdown
                .entry(check.name.clone())
                .or_default()
                .add(check.passed);
        }

        Self {
            http_reqs: samples.len() as u64,
            http_req_failed,
            http_req_duration: Trend::from_durations(samples.iter().map(|s| &s.latency)),
            iterations: iteration_durations.len() as u64,
            iteration_duration: Trend::from_durations(iteration_durations),
            dropped_iterations,
            checks: all_checks,
            check_breakdown,
            elapsed,
        }
    }

    /// Share of failed requests, `0` for a run without requests.
    pub fn error_rate(&self) -> f64 {
        self.http_req_failed.value()
    }

    /// Request latency percentile in milliseconds; `p` is a fraction.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.http_req_duration.percentile(p)
    }

    /// `count` events per second of the run, `0` for a run that took no time.
    pub fn per_second(&self, count: u64) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 { 0.0 } else { count as f64 / secs }
    }

    /// Value of `metric` under `aggregation`.
    ///
    /// `None` means the metric exists but has no data for it (e.g. a percentile of
    /// an empty trend). Unknown metrics and unsupported aggregations are rejected
    /// earlier, by [`crate::ThresholdSpec::validate`], and also yield `None` here.
    pub fn value(&self, metric: &str, aggregation: &Aggregation) -> Option<f64> {
        match (metric, aggregation) {
            ("http_reqs", Aggregation::Count) => Some(self.http_reqs as f64),
            ("iterations", Aggregation::Count) => Some(self.iterations as f64),
            ("dropped_iterations", Aggregation::Count) => Some(self.dropped_iterations as f64),
            ("http_reqs", Aggregation::Rate) => Some(self.per_second(self.http_reqs)),
            ("iterations", Aggregation::Rate) => Some(self.per_second(self.iterations)),
            ("dropped_iterations", Aggregation::Rate) => Some(self.per_second(self.dropped_iterations)),
            ("http_req_failed", Aggregation::Rate) => Some(self.http_req_failed.value()),
            ("checks", Aggregation::Rate) => Some(self.checks.value()),
            ("http_req_duration", a) => trend_value(&self.http_req_duration, a),
            ("iteration_duration", a) => trend_value(&self.iteration_duration, a),
            _ => None,
        }
    }
}

fn trend_value(trend: &Trend, aggregation: &Aggregation) -> Option<f64> {
    match aggregation {
        Aggregation::Avg => trend.avg(),
        Aggregation::Min => trend.min(),
        Aggregation::Max => trend.max(),
        Aggregation::Med => trend.med(),
        Aggregation::Percentile(p) => trend.p(*p),
        Aggregation::Count | Aggregation::Rate => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(ms: u64) -> Sample {
        Sample::response("GET", "http://t", Duration::from_millis(ms), 200, "")
    }

    fn status(code: u16) -> Sample {
        Sample::response("GET", "http://t", Duration::from_millis(10), code, "")
    }

    fn refused() -> Sample {
        Sample::failed("GET", "http://t", Duration::from_millis(1), "connection failed")
    }

    mod trend {
        use super::*;

        #[test]
        fn nearest_rank_on_zero_indexed_series() {
            let trend = Trend::from_millis(vec![500., 100., 400., 200., 300.]);
            // floor(0.95 * 4) = 3
            assert_eq!(trend.percentile(0.95), Some(400.));
            assert_eq!(trend.percentile(0.0), Some(100.));
            assert_eq!(trend.percentile(1.0), Some(500.));
            assert_eq!(trend.med(), Some(300.));
        }

        #[test]
        fn whole_percents_hit_their_exact_rank() {
            let trend = Trend::from_millis((0..=100u32).map(f64::from).collect());
            for percent in [29., 57., 58., 95., 99.] {
                assert_eq!(trend.p(percent), Some(percent));
            }
            assert_eq!(trend.percentile(0.29), Some(29.));
            assert_eq!(trend.percentile(0.57), Some(57.));
            assert_eq!(trend.percentile(0.58), Some(58.));
            // between ranks, still the lower one
            assert_eq!(trend.p(29.5), Some(29.));
        }

        #[test]
        fn single_value_is_every_percentile() {
            let trend = Trend::from_millis(vec![42.]);
            assert_eq!(trend.percentile(0.95), Some(42.));
            assert_eq!(trend.percentile(0.01), Some(42.));
        }

        #[test]
        fn empty_trend_has_no_percentile() {
            let trend = Trend::default();
            assert_eq!(trend.percentile(0.95), None);
            assert_eq!(trend.avg(), None);
            assert_eq!(trend.stats().count, 0);
        }
    }

    #[test]
    fn empty_run_has_zero_error_rate() {
        let agg = Aggregates::compute(&[], &[], &[], 0, Duration::ZERO, &FailurePolicy::default());
        assert_eq!(agg.error_rate(), 0.0);
        assert!(!agg.error_rate().is_nan());
        assert_eq!(agg.percentile(0.95), None);
    }

    #[test]
    fn default_policy_counts_transport_errors_and_bad_statuses() {
        let samples = [ok(10), status(404), status(503), refused()];
        let agg = Aggregates::compute(&samples, &[], &[], 0, Duration::ZERO, &FailurePolicy::default());
        assert_eq!(agg.http_reqs, 4);
        assert_eq!(agg.http_req_failed, Rate { hits: 3, total: 4 });
    }

    #[test]
    fn transport_only_policy_treats_statuses_as_data() {
        let samples = [ok(10), status(500), refused()];
        let agg = Aggregates::compute(&samples, &[], &[], 0, Duration::ZERO, &FailurePolicy::TransportOnly);
        assert_eq!(agg.http_req_failed, Rate { hits: 1, total: 3 });
    }

    #[test]
    fn dropped_iterations_do_not_affect_error_rate() {
        let samples = [ok(10), ok(20)];
        let agg = Aggregates::compute(
            &samples,
            &[Duration::from_millis(20); 2],
            &[],
            98,
            Duration::from_secs(2),
            &FailurePolicy::default(),
        );
        assert_eq!(agg.error_rate(), 0.0);
        assert_eq!(agg.dropped_iterations, 98);
        assert_eq!(agg.value("dropped_iterations", &Aggregation::Count), Some(98.));
    }

    #[test]
    fn custom_policy_still_counts_transport_errors() {
        let server_errors = FailurePolicy::custom(|s| s.status().is_some_and(|code| code >= 500));
        let agg = Aggregates::compute(&[refused(), refused()], &[], &[], 0, Duration::ZERO, &server_errors);
        assert_eq!(agg.error_rate(), 1.0);
    }

    #[test]
    fn counter_rates_are_per_second_of_the_run() {
        let samples = [ok(10), ok(10), ok(10), ok(10)];
        let durations = [Duration::from_millis(20); 2];
        let agg = Aggregates::compute(&samples, &durations, &[], 6, Duration::from_secs(2), &FailurePolicy::default());
        assert_eq!(agg.value("http_reqs", &Aggregation::Rate), Some(2.0));
        assert_eq!(agg.value("iterations", &Aggregation::Rate), Some(1.0));
        assert_eq!(agg.value("dropped_iterations", &Aggregation::Rate), Some(3.0));

        let instant = Aggregates::compute(&samples, &[], &[], 0, Duration::ZERO, &FailurePolicy::default());
        assert_eq!(instant.value("http_reqs", &Aggregation::Rate), Some(0.0));
    }

    #[test]
    fn checks_are_broken_down_by_name() {
        let checks = [
            CheckOutcome { name: "status is 201".into(), passed: true },
            CheckOutcome { name: "status is 201".into(), passed: false },
            CheckOutcome { name: "has id".into(), passed: true },
        ];
        let agg = Aggregates::compute(&[], &[], &checks, 0, Duration::ZERO, &FailurePolicy::default());
        assert_eq!(agg.checks, Rate { hits: 2, total: 3 });
        assert_eq!(agg.check_breakdown["status is 201"].value(), 0.5);
        assert_eq!(agg.check_breakdown["has id"].value(), 1.0);
    }

    #[test]
    fn computing_twice_yields_identical_aggregates() {
        let samples = [ok(30), refused(), ok(10), status(500)];
        let durations = [Duration::from_millis(31), Duration::from_millis(12)];
        let policy = FailurePolicy::default();
        let first = Aggregates::compute(&samples, &durations, &[], 3, Duration::ZERO, &policy);
        let second = Aggregates::compute(&samples, &durations, &[], 3, Duration::ZERO, &policy);
        assert_eq!(first, second);
    }

    #[test]
    fn reads_values_by_metric_and_aggregation() {
        let samples = [ok(100), ok(200), ok(300), ok(400), ok(500)];
        let agg = Aggregates::compute(&samples, &[], &[], 0, Duration::ZERO, &FailurePolicy::default());
        assert_eq!(agg.value("http_req_duration", &Aggregation::Percentile(95.)), Some(400.));

        let hundred: Vec<_> = (0..=100u64).map(ok).collect();
        let agg = Aggregates::compute(&hundred, &[], &[], 0, Duration::ZERO, &FailurePolicy::default());
        for percent in [29., 57., 58.] {
            assert_eq!(agg.value("http_req_duration", &Aggregation::Percentile(percent)), Some(percent));
        }
        assert_eq!(agg.value("http_req_duration", &Aggregation::Avg), Some(300.));
        assert_eq!(agg.value("http_reqs", &Aggregation::Count), Some(5.));
        assert_eq!(agg.value("http_req_failed", &Aggregation::Rate), Some(0.));
        assert_eq!(agg.value("nope", &Aggregation::Rate), None);
    }

    #[test]
    fn serializes_trends_as_stats() {
        let agg = Aggregates::compute(&[ok(50)], &[], &[], 0, Duration::ZERO, &FailurePolicy::default());
        let json = serde_json::to_value(&agg).unwrap();
        assert_eq!(json["http_req_duration"]["p95"], 50.0);
        assert_eq!(json["http_req_failed"]["rate"], 0.0);
    }
}
