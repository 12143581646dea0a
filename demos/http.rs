use std::time::Duration;

use rafaga::{
    Dispatcher, HarnessConfig, Reporter, Scenario, Stage, StagedExecutor, StdoutReporter, ThresholdSpec, VirtualUser,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Build the dispatcher once: it owns the connection pool every worker shares.
    let dispatcher = Dispatcher::new(HarnessConfig::from_env()?)?;

    let executor = StagedExecutor::builder()
        .start_target(0)
        .stages(vec![
            // Start with a ramp up from 0 to 10 workers over 3 seconds
            Stage::new(Duration::from_secs(3), 10),
            // hold for a bit
            Stage::new(Duration::from_secs(3), 10),
            // ramp down to nothing
            Stage::new(Duration::from_secs(3), 0),
        ])
        .build();

    let scenario = Scenario::builder()
        .name("Http scenario")
        .action(|vu: VirtualUser| async move {
            let res = vu.get("/api/test/ping").await;
            vu.check("status is 200", res.status() == Some(200)).await;
        })
        .dispatcher(dispatcher)
        .thresholds(vec![
            "error_rate < 0.01".parse::<ThresholdSpec>()?,
            "p95 < 500".parse::<ThresholdSpec>()?,
        ])
        .build();

    let report = scenario.run(&executor).await?;
    StdoutReporter.report(&report).await?;

    if !report.passed() {
        std::process::exit(1);
    }
    Ok(())
}
