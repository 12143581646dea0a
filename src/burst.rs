use futures::{StreamExt, stream::FuturesUnordered};
use std::future::Future;
use tokio::time::Instant;

use crate::{
    dispatch::{Dispatcher, Request},
    sample::Sample,
};

/// Fire `count` attempts at once and wait for every one of them.
///
/// `attempt` is called with the index of each attempt and every returned future
/// is spawned on its own task, so all of them are in flight together and the wall
/// clock cost is that of the slowest one. Samples come back in completion order.
///
/// Nothing short-circuits: a failing attempt, or even a panicking one, still
/// yields exactly one sample, so the result always has `count` entries.
pub async fn burst<F, Fut>(count: usize, attempt: F) -> Vec<Sample>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Sample> + Send + 'static,
{
    let mut in_flight: FuturesUnordered<_> = (0..count)
        .map(|i| {
            let start = Instant::now();
            let handle = tokio::spawn(attempt(i));
            async move { (i, start, handle.await) }
        })
        .collect();

    let mut samples = Vec::with_capacity(count);
    while let Some((i, start, joined)) = in_flight.next().await {
        match joined {
            Ok(sample) => samples.push(sample),
            Err(e) => {
                tracing::error!("Burst attempt {i} panicked: {e}");
                samples.push(Sample::failed(
                    "UNKNOWN",
                    "",
                    start.elapsed(),
                    format!("attempt panicked: {e}"),
                ));
            }
        }
    }
    samples
}

impl Dispatcher {
    /// Send `count` copies of `request` concurrently.
    ///
    /// Works on its own, no scenario needed: this is the "send N requests at once
    /// and see what happens" primitive used for contention checks.
    pub async fn burst(&self, count: usize, request: &Request) -> Vec<Sample> {
        tracing::debug!("Bursting {count} x {} {}", request.method, request.path);
        burst(count, |_| {
            let dispatcher = self.clone();
            let request = request.clone();
            async move { dispatcher.dispatch(&request).await }
        })
        .await
    }
}
