use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fmt::{self, Display},
    future::Future,
    path::PathBuf,
    time::Duration,
};

use crate::{
    aggregate::{Aggregates, Rate, Trend},
    error::{ConfigError, ReportError},
    sample::{Sample, millis},
    scenario::FailurePolicy,
    threshold::{ThresholdSpec, Verdict, Verdicts, evaluate},
    vu::{CheckOutcome, Execution},
};

/// The terminal artifact of a scenario run.
///
/// Holds the raw samples in completion order, the aggregated metrics and the
/// verdict of every threshold. It is built once at the end of a run and never
/// changes afterwards; it is pure data, writing it anywhere is the job of a
/// [`Reporter`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "elapsed_ms", serialize_with = "millis::serialize")]
    pub elapsed: Duration,
    pub samples: Vec<Sample>,
    #[serde(rename = "iteration_durations_ms", serialize_with = "millis::serialize_vec")]
    pub iteration_durations: Vec<Duration>,
    pub checks: Vec<CheckOutcome>,
    pub dropped_iterations: u64,
    pub aggregates: Aggregates,
    pub thresholds: Verdicts,
}

impl RunReport {
    pub fn new(
        scenario: impl Into<String>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        execution: Execution,
        failure: &FailurePolicy,
        thresholds: &[ThresholdSpec],
    ) -> Result<Self, ConfigError> {
        let Execution {
            samples,
            iteration_durations,
            checks,
            dropped_iterations,
        } = execution;
        let aggregates = Aggregates::compute(
            &samples,
            &iteration_durations,
            &checks,
            dropped_iterations,
            elapsed,
            failure,
        );
        let thresholds = evaluate(&aggregates, thresholds)?;

        Ok(Self {
            scenario: scenario.into(),
            started_at,
            elapsed,
            samples,
            iteration_durations,
            checks,
            dropped_iterations,
            aggregates,
            thresholds,
        })
    }

    /// `true` unless a threshold failed.
    pub fn passed(&self) -> bool {
        self.thresholds.passed()
    }
}

/// Human summary in the spirit of the k6 end-of-test output.
impl Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let agg = &self.aggregates;
        writeln!(f, "scenario: {} ({:.2?}, started {})", self.scenario, self.elapsed, self.started_at.to_rfc3339())?;
        writeln!(f)?;
        writeln!(f, "  {:.<24}: {}", "http_reqs", count(agg, agg.http_reqs))?;
        writeln!(f, "  {:.<24}: {}", "http_req_failed", rate(&agg.http_req_failed))?;
        writeln!(f, "  {:.<24}: {}", "http_req_duration", trend(&agg.http_req_duration))?;
        writeln!(f, "  {:.<24}: {}", "iterations", count(agg, agg.iterations))?;
        writeln!(f, "  {:.<24}: {}", "iteration_duration", trend(&agg.iteration_duration))?;
        writeln!(f, "  {:.<24}: {}", "dropped_iterations", agg.dropped_iterations)?;
        if agg.checks.total > 0 {
            writeln!(f, "  {:.<24}: {}", "checks", rate(&agg.checks))?;
            for (name, check) in &agg.check_breakdown {
                let mark = if check.hits == check.total { '✓' } else { '✗' };
                writeln!(f, "    {mark} {name} ({})", rate(check))?;
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(f)?;
            writeln!(f, "  thresholds:")?;
            for (threshold, v) in self.thresholds.iter() {
                let label = match v.verdict {
                    Verdict::Pass => "PASS",
                    Verdict::Fail => "FAIL",
                    Verdict::NoData => "NO DATA",
                };
                match v.observed {
                    Some(observed) => writeln!(f, "    {label:<7} {threshold} (observed {observed:.4})")?,
                    None => writeln!(f, "    {label:<7} {threshold}")?,
                }
            }
        }
        Ok(())
    }
}

fn count(agg: &Aggregates, n: u64) -> String {
    format!("{n} ({:.2}/s)", agg.per_second(n))
}

fn rate(r: &Rate) -> String {
    format!("{:.2}% ({} of {})", r.value() * 100.0, r.hits, r.total)
}

fn trend(t: &Trend) -> String {
    let s = t.stats();
    let ms = |v: Option<f64>| v.map_or_else(|| "-".to_owned(), |v| format!("{v:.2}ms"));
    format!(
        "avg={} min={} med={} max={} p(90)={} p(95)={}",
        ms(s.avg),
        ms(s.min),
        ms(s.med),
        ms(s.max),
        ms(s.p90),
        ms(s.p95)
    )
}

/// A [`Reporter`] takes a [`RunReport`] somewhere: a terminal, a file, a service.
///
/// Reporters are the I/O boundary of the crate; everything before them is pure
/// computation over the recorded samples.
///
/// # Example
/// ```rust
/// use rafaga::{ReportError, Reporter, RunReport};
///
/// struct Verdict;
/// impl Reporter for Verdict {
///     async fn report(&self, report: &RunReport) -> Result<(), ReportError> {
///         println!("{}: {}", report.scenario, if report.passed() { "ok" } else { "FAILED" });
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter {
    fn report(&self, report: &RunReport) -> impl Future<Output = Result<(), ReportError>>;
}

/// Prints the summary to stdout.
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, report: &RunReport) -> Result<(), ReportError> {
        println!("{report}");
        Ok(())
    }
}

/// Writes the whole report, raw samples included, as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct JsonReporter {
    pub path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, report: &RunReport) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!("Report written to {}", self.path.display());
        Ok(())
    }
}
