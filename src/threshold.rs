//! Threshold evaluator: pass/fail conditions over the aggregated metrics.
//!
//! Thresholds are written the way k6 options declare them, an expression attached
//! to a metric:
//!
//! ```text
//! http_req_failed:   rate<0.01
//! http_req_duration: p(95)<500
//! checks:            rate>0.99
//! http_reqs:         rate>100
//! ```
//!
//! On counters such as `http_reqs`, `rate` is per second of the run.
//!
//! A standalone shorthand is accepted as well, for the two conditions almost every
//! scenario declares: `error_rate < 0.01` and `p95 < 100` (any trend aggregation
//! alone refers to `http_req_duration`).

use serde::{Serialize, Serializer};
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::{
    aggregate::{Aggregates, metric_kind},
    config::parse_duration,
    error::ConfigError,
};

/// How a metric is reduced to the number a threshold compares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Rate,
    Count,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `0..=100`.
    Percentile(f64),
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let aggregation = match s {
            "rate" => Aggregation::Rate,
            "count" => Aggregation::Count,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            _ => {
                let raw = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .or_else(|| s.strip_prefix('p'))
                    .ok_or_else(|| format!("unknown aggregation `{s}`"))?;
                let p: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad percentile `{s}`"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} out of 0..=100"));
                }
                Aggregation::Percentile(p)
            }
        };
        Ok(aggregation)
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Count => f.write_str("count"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    pub fn holds(self, observed: f64, limit: f64) -> bool {
        match self {
            Comparator::Lt => observed < limit,
            Comparator::Le => observed <= limit,
            Comparator::Gt => observed > limit,
            Comparator::Ge => observed >= limit,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        })
    }
}

/// A named metric, an aggregation of it and the bound it must respect.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub aggregation: Aggregation,
    pub comparator: Comparator,
    /// Milliseconds for trends, a fraction for rates, a plain number for counters.
    pub value: f64,
}

impl ThresholdSpec {
    pub fn new(metric: impl Into<String>, aggregation: Aggregation, comparator: Comparator, value: f64) -> Self {
        Self {
            metric: metric.into(),
            aggregation,
            comparator,
            value,
        }
    }

    /// Parse a k6 expression such as `p(95)<500` attached to `metric`.
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidThreshold {
            expression: format!("{metric}: {expression}"),
            reason,
        };
        let (aggregation, comparator, value) = split_expression(expression).map_err(invalid)?;
        let aggregation = aggregation.parse::<Aggregation>().map_err(invalid)?;
        let value = parse_value(value).map_err(invalid)?;
        Ok(Self::new(metric.trim(), aggregation, comparator, value))
    }

    /// Reject unknown metrics and aggregations the metric does not support.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let kind = metric_kind(&self.metric).ok_or_else(|| ConfigError::UnknownMetric(self.metric.clone()))?;
        if !kind.supports(&self.aggregation) {
            return Err(ConfigError::InvalidAggregation {
                metric: self.metric.clone(),
                aggregation: self.aggregation.to_string(),
            });
        }
        Ok(())
    }
}

impl FromStr for ThresholdSpec {
    type Err = ConfigError;

    /// Either `metric: expression` or the shorthand `error_rate < x` / `p95 < x`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((metric, expression)) = s.split_once(':') {
            return Self::parse(metric, expression);
        }

        let invalid = |reason: String| ConfigError::InvalidThreshold {
            expression: s.to_owned(),
            reason,
        };
        let (left, comparator, value) = split_expression(s).map_err(invalid)?;
        let value = parse_value(value).map_err(invalid)?;
        let (metric, aggregation) = match left {
            "error_rate" => ("http_req_failed", Aggregation::Rate),
            other => match other.parse::<Aggregation>().map_err(invalid)? {
                Aggregation::Rate | Aggregation::Count => {
                    return Err(invalid(format!("`{other}` needs a metric name")));
                }
                trend => ("http_req_duration", trend),
            },
        };
        Ok(Self::new(metric, aggregation, comparator, value))
    }
}

impl fmt::Display for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}{}{}", self.metric, self.aggregation, self.comparator, self.value)
    }
}

/// Split `left <op> right`, trimming both sides.
fn split_expression(expression: &str) -> Result<(&str, Comparator, &str), String> {
    let at = expression
        .find(['<', '>'])
        .ok_or_else(|| "missing comparator".to_owned())?;
    let (left, rest) = expression.split_at(at);
    let (comparator, right) = match (rest.as_bytes()[0], rest[1..].strip_prefix('=')) {
        (b'<', Some(right)) => (Comparator::Le, right),
        (b'<', None) => (Comparator::Lt, &rest[1..]),
        (_, Some(right)) => (Comparator::Ge, right),
        (_, None) => (Comparator::Gt, &rest[1..]),
    };
    let (left, right) = (left.trim(), right.trim());
    if left.is_empty() || right.is_empty() {
        return Err("expected `<aggregation> <comparator> <value>`".to_owned());
    }
    Ok((left, comparator, right))
}

/// A bare number, or a duration (`500ms`, `1.5s`) converted to milliseconds.
fn parse_value(raw: &str) -> Result<f64, String> {
    if let Ok(value) = raw.parse::<f64>() {
        return Ok(value);
    }
    parse_duration(raw)
        .map(|d| d.as_nanos() as f64 / 1e6)
        .map_err(|_| format!("bad value `{raw}`"))
}

/// Outcome of one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// The metric exists but recorded nothing to compare, e.g. a percentile of a
    /// run without requests. Does not fail the run.
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdVerdict {
    pub observed: Option<f64>,
    pub verdict: Verdict,
}

/// Verdict of every threshold, keyed by its textual form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Verdicts(BTreeMap<String, ThresholdVerdict>);

impl Verdicts {
    /// `true` unless some threshold failed.
    pub fn passed(&self) -> bool {
        self.0.values().all(|v| v.verdict != Verdict::Fail)
    }

    pub fn get(&self, threshold: &str) -> Option<&ThresholdVerdict> {
        self.0.get(threshold)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ThresholdVerdict)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Verdicts {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

/// Compare every threshold against `aggregates`.
///
/// Every spec is validated first, so a misconfigured threshold is reported as a
/// [`ConfigError`] and never confused with a failing one.
pub fn evaluate(aggregates: &Aggregates, specs: &[ThresholdSpec]) -> Result<Verdicts, ConfigError> {
    for spec in specs {
        spec.validate()?;
    }

    let verdicts = specs
        .iter()
        .map(|spec| {
            let observed = aggregates.value(&spec.metric, &spec.aggregation);
            let verdict = match observed {
                None => Verdict::NoData,
                Some(v) if spec.comparator.holds(v, spec.value) => Verdict::Pass,
                Some(_) => Verdict::Fail,
            };
            if verdict == Verdict::Fail {
                tracing::warn!("Threshold crossed: {spec} (observed {observed:?})");
            }
            (spec.to_string(), ThresholdVerdict { observed, verdict })
        })
        .collect();
    Ok(Verdicts(verdicts))
}
