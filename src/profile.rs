//! Load profiles and the k6-style options block they are usually written in.
//!
//! ```json
//! {
//!   "scenarios": {
//!     "invitar_top3": {
//!       "executor": "ramping-arrival-rate",
//!       "startRate": 0,
//!       "timeUnit": "1s",
//!       "preAllocatedVUs": 10,
//!       "maxVUs": 50,
//!       "stages": [
//!         { "duration": "30s", "target": 20 },
//!         { "duration": "1m", "target": 20 },
//!         { "duration": "30s", "target": 0 }
//!       ]
//!     }
//!   },
//!   "thresholds": {
//!     "http_req_failed": ["rate<0.01"],
//!     "http_req_duration": ["p(95)<500"]
//!   }
//! }
//! ```
//!
//! The `vus`/`duration` and top-level `stages` shortcuts are accepted as well.

use serde::{Deserialize, Deserializer};
use std::{collections::BTreeMap, time::Duration};

use crate::{
    config::deserialize_duration,
    error::ConfigError,
    executor::{ArrivalRateExecutor, ConstantExecutor, Executor, Stage, StagedExecutor},
    scenario::Scenario,
    threshold::ThresholdSpec,
    vu::{Execution, VirtualUser},
};

/// Traffic shape over time, one variant per executor.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "executor")]
pub enum LoadProfile {
    #[serde(rename = "constant-vus")]
    Constant(ConstantExecutor),
    #[serde(rename = "ramping-arrival-rate")]
    RampingArrivalRate(ArrivalRateExecutor),
    #[serde(rename = "ramping-vus")]
    Staged(StagedExecutor),
}

impl From<ConstantExecutor> for LoadProfile {
    fn from(executor: ConstantExecutor) -> Self {
        LoadProfile::Constant(executor)
    }
}

impl From<ArrivalRateExecutor> for LoadProfile {
    fn from(executor: ArrivalRateExecutor) -> Self {
        LoadProfile::RampingArrivalRate(executor)
    }
}

impl From<StagedExecutor> for LoadProfile {
    fn from(executor: StagedExecutor) -> Self {
        LoadProfile::Staged(executor)
    }
}

impl<F, Fut> Executor<F, Fut> for LoadProfile
where
    F: Fn(VirtualUser) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            LoadProfile::Constant(e) => <ConstantExecutor as Executor<F, Fut>>::validate(e),
            LoadProfile::RampingArrivalRate(e) => <ArrivalRateExecutor as Executor<F, Fut>>::validate(e),
            LoadProfile::Staged(e) => <StagedExecutor as Executor<F, Fut>>::validate(e),
        }
    }

    fn duration(&self) -> Duration {
        match self {
            LoadProfile::Constant(e) => <ConstantExecutor as Executor<F, Fut>>::duration(e),
            LoadProfile::RampingArrivalRate(e) => <ArrivalRateExecutor as Executor<F, Fut>>::duration(e),
            LoadProfile::Staged(e) => <StagedExecutor as Executor<F, Fut>>::duration(e),
        }
    }

    async fn exec(&self, scenario: &Scenario<F, Fut>) -> Execution {
        match self {
            LoadProfile::Constant(e) => e.exec(scenario).await,
            LoadProfile::RampingArrivalRate(e) => e.exec(scenario).await,
            LoadProfile::Staged(e) => e.exec(scenario).await,
        }
    }
}

/// The options block of a load test: profiles plus thresholds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub scenarios: BTreeMap<String, LoadProfile>,
    pub vus: Option<usize>,
    #[serde(default, deserialize_with = "optional_duration")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Metric name to threshold expressions, e.g. `"http_req_duration": ["p(95)<500"]`.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

fn optional_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    deserialize_duration(d).map(Some)
}

impl Options {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Every profile to run, by name.
    ///
    /// Explicit `scenarios` win. Otherwise top-level `stages` make a ramping
    /// profile starting at `vus` (default 1), and `duration` a constant one with
    /// `vus` workers (default 1).
    pub fn profiles(&self) -> Result<Vec<(String, LoadProfile)>, ConfigError> {
        if !self.scenarios.is_empty() {
            return Ok(self.scenarios.clone().into_iter().collect());
        }

        let vus = self.vus.unwrap_or(1);
        let profile = if !self.stages.is_empty() {
            StagedExecutor::builder()
                .start_target(vus as u64)
                .stages(self.stages.clone())
                .build()
                .into()
        } else if let Some(duration) = self.duration {
            ConstantExecutor::builder().workers(vus).duration(duration).build().into()
        } else {
            return Err(ConfigError::InvalidProfile(
                "options define neither scenarios, stages nor a duration".into(),
            ));
        };
        Ok(vec![("default".to_owned(), profile)])
    }

    /// Parse and validate every threshold expression.
    pub fn threshold_specs(&self) -> Result<Vec<ThresholdSpec>, ConfigError> {
        let mut specs = Vec::new();
        for (metric, expressions) in &self.thresholds {
            for expression in expressions {
                let spec = ThresholdSpec::parse(metric, expression)?;
                spec.validate()?;
                specs.push(spec);
            }
        }
        Ok(specs)
    }
}
