//! Rafaga, a synthetic-traffic harness for black-box HTTP load and contract tests.
//!
//! Rafaga drives bursts and ramps of concurrent requests against one HTTP target,
//! collects every outcome without letting a failed request abort the batch, and
//! reduces the outcomes into verdicts: error-rate thresholds, latency
//! percentiles and response-shape contracts. Load profiles and thresholds follow
//! k6 conventions so existing options blocks can be reused as-is.
//!
//! # Architecture
//!
//! The main building blocks, leaves first:
//!
//! - [`Sample`]: the outcome of a single attempt. A transport failure is a sample
//!   too, never an error.
//! - [`Dispatcher`]: performs one request and turns whatever happens into a
//!   `Sample`. [`Dispatcher::burst`] fires N copies at once.
//! - [`Scenario`]: a named iteration function plus thresholds and a
//!   [`FailurePolicy`]. The iteration function gets a [`VirtualUser`] to send
//!   requests and record checks through.
//! - [`Executor`]: runs a scenario over wall-clock time. [`ConstantExecutor`],
//!   [`ArrivalRateExecutor`] and [`StagedExecutor`] cover the usual profiles, and
//!   [`LoadProfile`] picks one from an [`Options`] block.
//! - [`Aggregates`]: a pure reduction of the recorded samples into k6-style metrics.
//! - [`ThresholdSpec`]: a pass/fail condition over one metric.
//! - [`Schema`]: the expected shape of a JSON body, checked independently of the run.
//! - [`RunReport`]: everything above, handed to a [`Reporter`].
//!
//! # Errors
//!
//! Only configuration problems are errors ([`ConfigError`]), and they are raised
//! before any traffic is sent. Once a run starts it always completes and yields a
//! report, even if every single request fails.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use rafaga::{
//!     ConstantExecutor, Dispatcher, HarnessConfig, Reporter, Scenario, StdoutReporter, ThresholdSpec, VirtualUser,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scenario = Scenario::builder()
//!     .name("pagos")
//!     .action(|vu: VirtualUser| async move {
//!         let res = vu.get("/api/pagos/ultimas").await;
//!         vu.check("status is 200", res.status() == Some(200)).await;
//!     })
//!     .dispatcher(Dispatcher::new(HarnessConfig::from_env()?)?)
//!     .thresholds(vec![
//!         "error_rate < 0.01".parse::<ThresholdSpec>()?,
//!         "p95 < 500".parse::<ThresholdSpec>()?,
//!     ])
//!     .build();
//!
//! let executor = ConstantExecutor::builder()
//!     .workers(10)
//!     .duration(Duration::from_secs(30))
//!     .build();
//!
//! let report = scenario.run(&executor).await?;
//! StdoutReporter.report(&report).await?;
//! # Ok(())
//! # }
//! ```

/// Metrics computed from a run
pub mod aggregate;
/// Fire N requests at once
pub mod burst;
/// Target and transport settings
pub mod config;
/// Response-shape contracts
pub mod contract;
/// One request, one sample
pub mod dispatch;
pub mod error;
/// Orchestrators that define how things will actually run
pub mod executor;
pub mod profile;
/// Run reports and reporters
pub mod report;
pub mod sample;
/// Main module of the crate that glues everything together
pub mod scenario;
pub mod threshold;
/// What the iteration function talks to
pub mod vu;

pub use aggregate::{Aggregates, Rate, Trend, TrendStats};
pub use burst::burst;
pub use config::{HarnessConfig, parse_duration};
pub use contract::{ObjectSchema, Schema, Violation};
pub use dispatch::{Body, Dispatcher, Method, Request};
pub use error::{ConfigError, ReportError};
pub use executor::{
    ArrivalRateExecutor, ConstantExecutor, Executor, Interpolation, Stage, StagedExecutor, StopMode,
};
pub use profile::{LoadProfile, Options};
pub use report::{JsonReporter, Reporter, RunReport, StdoutReporter};
pub use sample::{Outcome, Sample};
pub use scenario::{FailurePolicy, Scenario};
pub use threshold::{Aggregation, Comparator, ThresholdSpec, Verdict, Verdicts};
pub use vu::{CheckOutcome, Execution, VirtualUser};
