use std::time::Duration;

use rafaga::{
    ConstantExecutor, Dispatcher, FailurePolicy, HarnessConfig, Reporter, Scenario, Schema, StdoutReporter,
    ThresholdSpec, VirtualUser,
};
use tracing_subscriber::EnvFilter;

fn ultimas() -> Schema {
    Schema::array_of(
        Schema::object()
            .field("id", Schema::Number)
            .field("estado", Schema::one_of(["PENDIENTE", "APROBADO", "RECHAZADO"])),
    )
}

async fn consultar_pagos(vu: VirtualUser) {
    let res = vu.get("/api/pagos/ultimas").await;
    let contract = ultimas().validate_sample(&res);
    if let Err(violation) = &contract {
        tracing::warn!("Worker {} got an unexpected body: {violation}", vu.id());
    }
    vu.check("ultimas matches contract", contract.is_ok()).await;

    // follow the first payment, if any
    let first = res
        .json()
        .ok()
        .and_then(|body| body.get(0).and_then(|p| p.get("id")).and_then(|id| id.as_u64()));
    if let Some(id) = first {
        let detail = vu.get(&format!("/api/pagos/{id}")).await;
        vu.check("detail is 200", detail.status() == Some(200)).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let scenario = Scenario::builder()
        .name("pagos soak")
        .action(consultar_pagos)
        .dispatcher(Dispatcher::new(HarnessConfig::from_env()?)?)
        // 404 on a payment that disappeared meanwhile is fine, 5xx is not
        .failure(FailurePolicy::expected([200..=499]))
        .thresholds(vec![
            "error_rate < 0.01".parse::<ThresholdSpec>()?,
            "p95 < 800".parse::<ThresholdSpec>()?,
            "checks: rate>0.99".parse::<ThresholdSpec>()?,
        ])
        .build();

    let executor = ConstantExecutor::builder()
        .workers(10)
        .duration(Duration::from_secs(10 * 60))
        .think_time(Duration::from_secs(1))
        .build();

    let report = scenario.run(&executor).await?;
    StdoutReporter.report(&report).await?;

    if !report.passed() {
        std::process::exit(1);
    }
    Ok(())
}
