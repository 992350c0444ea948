#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jobmon::events::EventBus;
use jobmon::history::HistoryStore;
use jobmon::job::instance::OutputCapacity;
use jobmon::latch::LatchCoordinator;
use jobmon::supervisor::{LiveRegistry, ProcessSupervisor, RunOptions};

/// A fully wired supervisor with all collaborators exposed, for tests
/// that drive instances without going through the IPC server.
pub struct TestHarness {
    pub supervisor: ProcessSupervisor,
    pub bus: Arc<EventBus>,
    pub registry: Arc<LiveRegistry>,
    pub latches: Arc<LatchCoordinator>,
}

/// Harness without persistence and with a short stop grace period.
pub fn harness() -> TestHarness {
    harness_with_history(None)
}

pub fn harness_with_history(history: Option<Arc<HistoryStore>>) -> TestHarness {
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(LiveRegistry::new());
    let latches = Arc::new(LatchCoordinator::new());
    let options = RunOptions {
        stop_grace: Duration::from_secs(1),
        output_capacity: OutputCapacity::default(),
    };
    let supervisor = ProcessSupervisor::new(
        registry.clone(),
        latches.clone(),
        bus.clone(),
        history,
        options,
    );
    TestHarness {
        supervisor,
        bus,
        registry,
        latches,
    }
}
