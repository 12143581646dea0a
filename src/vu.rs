use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    dispatch::{Dispatcher, Request},
    sample::Sample,
};

/// Capacity of the event channel between workers and the collector.
pub(crate) const EVENT_BUFFER: usize = 4096;

/// Everything a worker reports back while a scenario runs.
#[derive(Debug, Clone)]
pub enum Event {
    Sample(Sample),
    Iteration(Duration),
    Check(CheckOutcome),
}

/// Result of a named, non-fatal assertion made during an iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
}

/// Handle given to the iteration function on every call.
///
/// Requests made through it are recorded automatically; the returned [`Sample`]
/// is a copy the iteration can inspect or validate. Do not move a `VirtualUser`
/// into a task that outlives the iteration: the run only finishes once every
/// handle is gone.
#[derive(Debug, Clone)]
pub struct VirtualUser {
    id: usize,
    iteration: u64,
    dispatcher: Dispatcher,
    events: mpsc::Sender<Event>,
}

impl VirtualUser {
    pub(crate) fn new(id: usize, dispatcher: Dispatcher, events: mpsc::Sender<Event>) -> Self {
        Self {
            id,
            iteration: 0,
            dispatcher,
            events,
        }
    }

    /// Index of the worker running this iteration.
    pub fn id(&self) -> usize {
        self.id
    }

    /// How many iterations this worker completed before the current one.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Dispatch `request` and record the resulting sample.
    pub async fn request(&self, request: &Request) -> Sample {
        let sample = self.dispatcher.dispatch(request).await;
        self.record(sample.clone()).await;
        sample
    }

    pub async fn get(&self, path: &str) -> Sample {
        self.request(&Request::get(path)).await
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> Sample {
        self.request(&Request::post_json(path, body)).await
    }

    /// Record a sample produced elsewhere (custom transports, replays, tests).
    pub async fn record(&self, sample: Sample) {
        self.emit(Event::Sample(sample)).await;
    }

    /// Record a named check. Returns `passed` so it can be used inline.
    pub async fn check(&self, name: impl Into<String>, passed: bool) -> bool {
        self.emit(Event::Check(CheckOutcome {
            name: name.into(),
            passed,
        }))
        .await;
        passed
    }

    pub(crate) async fn finish_iteration(&mut self, took: Duration) {
        self.emit(Event::Iteration(took)).await;
        self.iteration += 1;
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Worker {} dropped an event: collector is gone.", self.id);
        }
    }
}

/// Everything gathered while an executor ran, in arrival order.
///
/// Arrival order on the channel is completion order, which is the only order the
/// harness promises.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub samples: Vec<Sample>,
    pub iteration_durations: Vec<Duration>,
    pub checks: Vec<CheckOutcome>,
    /// Arrivals that could not start because the worker pool was saturated.
    pub dropped_iterations: u64,
}

impl Execution {
    fn consume(&mut self, event: Event) {
        match event {
            Event::Sample(sample) => self.samples.push(sample),
            Event::Iteration(took) => self.iteration_durations.push(took),
            Event::Check(check) => self.checks.push(check),
        }
    }
}

/// Spawn the collector and hand back the sender workers report into.
pub(crate) fn spawn_collector() -> (mpsc::Sender<Event>, tokio::task::JoinHandle<Execution>) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let handle = tokio::spawn(collector_task(rx, EVENT_BUFFER));
    (tx, handle)
}

/// Drain events in batches until every sender is dropped.
pub(crate) async fn collector_task(mut rx: mpsc::Receiver<Event>, batch_size: usize) -> Execution {
    let mut execution = Execution::default();
    let mut batch = Vec::with_capacity(batch_size);

    while rx.recv_many(&mut batch, batch_size).await > 0 {
        for event in batch.drain(..) {
            execution.consume(event);
        }
    }
    execution
}
