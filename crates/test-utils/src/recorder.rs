#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobmon::events::{EventBus, JobEvent};
use jobmon::job::RunState;

/// Records every event a bus listener observes, for assertions on event
/// content and ordering.
///
/// Attach it **before** launching an instance to observe the full
/// lifecycle from NONE -> CREATED onwards.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<JobEvent>>>,
    task: tokio::task::JoinHandle<()>,
}

impl EventRecorder {
    pub fn attach(bus: &EventBus, job_filter: Option<&str>) -> Self {
        let (_id, mut rx) = bus.subscribe(job_filter.map(str::to_string));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.lock().unwrap().push(event);
            }
        });
        Self { events, task }
    }

    /// All events observed so far, in delivery order.
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    /// The `new_state` sequence of observed state-change events.
    pub fn states(&self) -> Vec<RunState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                JobEvent::StateChanged { new_state, .. } => Some(new_state),
                JobEvent::Output { .. } => None,
            })
            .collect()
    }

    /// Output chunks observed so far, in delivery order.
    pub fn output_chunks(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                JobEvent::Output { chunk, .. } => Some(chunk),
                JobEvent::StateChanged { .. } => None,
            })
            .collect()
    }

    /// Poll until the given state has been observed.
    pub async fn wait_for_state(&self, state: RunState) {
        for _ in 0..200 {
            if self.states().contains(&state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("state {state} was not observed; saw {:?}", self.states());
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
