mod common;

use std::time::Duration;

use rafaga::{
    ConstantExecutor, Dispatcher, HarnessConfig, Options, Reporter, Scenario, Schema, StagedExecutor, Stage,
    JsonReporter, Verdict, VirtualUser,
};

fn dispatcher(base_url: &str) -> Dispatcher {
    Dispatcher::new(HarnessConfig::builder().base_url(base_url).build()).unwrap()
}

fn top3() -> Schema {
    Schema::array_of(
        Schema::object()
            .field("id", Schema::Number)
            .field("nombre", Schema::String),
    )
}

async fn consultar_top3(vu: VirtualUser) {
    let res = vu.get("/api/invitaciones/top3").await;
    vu.check("status is 200", res.status() == Some(200)).await;
    vu.check("body matches contract", top3().validate_sample(&res).is_ok())
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn constant_load_against_a_healthy_target_passes() {
    let base = common::spawn_target().await;
    let scenario = Scenario::builder()
        .name("top3")
        .action(consultar_top3)
        .dispatcher(dispatcher(&base))
        .thresholds(vec![
            "error_rate < 0.01".parse().unwrap(),
            "p95 < 1000".parse().unwrap(),
            "checks: rate>0.99".parse().unwrap(),
        ])
        .build();
    let executor = ConstantExecutor::builder()
        .workers(3)
        .duration(Duration::from_millis(300))
        .build();

    let report = scenario.run(&executor).await.unwrap();

    assert!(report.aggregates.http_reqs >= 3);
    assert_eq!(report.aggregates.iterations, report.aggregates.http_reqs);
    assert_eq!(report.aggregates.checks.total, 2 * report.aggregates.http_reqs);
    assert_eq!(report.aggregates.error_rate(), 0.0);
    assert!(report.passed(), "{report}");
}

#[tokio::test]
async fn unreachable_target_still_yields_a_report() {
    let addr = common::closed_port().await;
    let scenario = Scenario::builder()
        .name("down")
        .action(consultar_top3)
        .dispatcher(dispatcher(&format!("http://{addr}")))
        .thresholds(vec!["error_rate < 0.01".parse().unwrap()])
        .build();
    let executor = StagedExecutor::builder()
        .stages(vec![Stage::new(Duration::from_millis(200), 2)])
        .build();

    let report = scenario.run(&executor).await.unwrap();

    assert!(!report.samples.is_empty());
    assert!(report.samples.iter().all(|s| s.error().is_some()));
    assert_eq!(report.aggregates.error_rate(), 1.0);
    let (_, verdict) = report.thresholds.iter().next().unwrap();
    assert_eq!(verdict.verdict, Verdict::Fail);
    assert!(!report.passed());
}

#[tokio::test]
async fn options_block_drives_a_run_and_the_report_is_written() {
    let base = common::spawn_target().await;
    let options = Options::from_json(
        r#"{
            "vus": 2,
            "duration": "200ms",
            "thresholds": {
                "http_req_failed": ["rate<0.01"],
                "http_req_duration": ["p(95)<1000"]
            }
        }"#,
    )
    .unwrap();
    let (name, profile) = options.profiles().unwrap().remove(0);
    let scenario = Scenario::builder()
        .name(name)
        .action(consultar_top3)
        .dispatcher(dispatcher(&base))
        .thresholds(options.threshold_specs().unwrap())
        .build();

    let report = scenario.run(&profile).await.unwrap();
    assert!(report.passed(), "{report}");

    let path = std::env::temp_dir().join(format!("rafaga-scenario-{}.json", std::process::id()));
    JsonReporter::new(&path).report(&report).await.unwrap();
    let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written["scenario"], "default");
    assert_eq!(
        written["samples"].as_array().map(Vec::len),
        Some(report.samples.len())
    );
    std::fs::remove_file(path).unwrap();
}
