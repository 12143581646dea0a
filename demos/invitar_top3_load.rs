//! Ramping arrival rate against `invitar-top3`, configured with a k6 options block.
//!
//! ```text
//! API_BASE=http://localhost:8080 cargo run --example invitar_top3_load
//! ```

use std::time::Duration;

use rafaga::{Dispatcher, HarnessConfig, JsonReporter, Options, Reporter, Request, Scenario, Schema, StdoutReporter, VirtualUser};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const OPTIONS: &str = r#"{
    "scenarios": {
        "ramping": {
            "executor": "ramping-arrival-rate",
            "startRate": 5,
            "timeUnit": "1s",
            "preAllocatedVUs": 20,
            "maxVUs": 200,
            "stages": [
                { "duration": "2m", "target": 50 },
                { "duration": "1m", "target": 20 },
                { "duration": "2m", "target": 0 }
            ]
        }
    },
    "thresholds": {
        "http_req_failed": ["rate<0.01"],
        "http_req_duration": ["p(95)<500"]
    }
}"#;

async fn invitar_top3(vu: VirtualUser) {
    let res = vu
        .request(&Request::post_json("/api/solicitudes/invitar-top3", json!({})))
        .await;

    vu.check("status is 200", res.status() == Some(200)).await;
    vu.check("body is array", Schema::Array.validate_sample(&res).is_ok())
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options = Options::from_json(OPTIONS)?;
    let dispatcher = Dispatcher::new(HarnessConfig::from_env()?)?;
    let thresholds = options.threshold_specs()?;

    let mut passed = true;
    for (name, profile) in options.profiles()? {
        let scenario = Scenario::builder()
            .name(name.as_str())
            .action(invitar_top3)
            .dispatcher(dispatcher.clone())
            .thresholds(thresholds.clone())
            .build();

        let report = scenario.run(&profile).await?;
        StdoutReporter.report(&report).await?;
        JsonReporter::new(format!("{name}.json")).report(&report).await?;
        passed &= report.passed();
    }

    if !passed {
        std::process::exit(1);
    }
    Ok(())
}
