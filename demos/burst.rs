//! 20 concurrent POSTs to `invitar-top3`: none of them may end in a 5xx or a
//! transport error.

use rafaga::{Dispatcher, HarnessConfig, Request};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const TIMES: usize = 20;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dispatcher = Dispatcher::new(HarnessConfig::from_env()?)?;
    let request = Request::post_json("/api/solicitudes/invitar-top3", json!({}));

    let samples = dispatcher.burst(TIMES, &request).await;

    let mut bad = 0;
    for (i, sample) in samples.iter().enumerate() {
        match (sample.status(), sample.error()) {
            (Some(status), _) if (200..=499).contains(&status) => {
                println!("#{i}: {status} in {:.1}ms", sample.latency_ms());
            }
            (Some(status), _) => {
                bad += 1;
                println!("#{i}: unexpected status {status}");
            }
            (None, error) => {
                bad += 1;
                println!("#{i}: error {}", error.unwrap_or_default());
            }
        }
    }

    println!("{} of {TIMES} attempts failed", bad);
    if bad > 0 {
        std::process::exit(1);
    }
    Ok(())
}
