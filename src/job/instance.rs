// src/job/instance.rs

//! One concrete execution of a job.
//!
//! [`JobInstance`] is the live, shared object a supervision task drives
//! through the state machine. All mutation goes through [`transition`]
//! calls; the lifecycle is an append-only audit trail whose last entry is
//! always the current state. Every accepted transition is published to the
//! [`EventBus`] before the call returns, while the instance lock is held,
//! so listeners observe transitions in the exact order they occur.
//!
//! [`transition`]: JobInstance::transition

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{JobmonError, Result};
use crate::events::{EventBus, JobEvent, OutputStream};
use crate::job::state::RunState;
use crate::job::{JobDefinition, new_instance_id};

/// One appended entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: RunState,
    pub at: DateTime<Utc>,
    /// Exit code of the child process, recorded on terminal transitions
    /// where an exit was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Append-only sequence of state changes; timestamps are non-decreasing
/// and the last entry's state equals the instance's current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lifecycle {
    changes: Vec<StateChange>,
}

impl Lifecycle {
    pub fn from_changes(changes: Vec<StateChange>) -> Self {
        Self { changes }
    }

    pub fn state(&self) -> RunState {
        self.changes.last().map_or(RunState::None, |c| c.state)
    }

    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    pub fn changed_at(&self, state: RunState) -> Option<DateTime<Utc>> {
        self.changes.iter().find(|c| c.state == state).map(|c| c.at)
    }

    /// Set iff the current state is terminal.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.changes
            .last()
            .filter(|c| c.state.is_terminal())
            .map(|c| c.at)
    }

    /// Wall-clock duration between the start of execution and the end of
    /// the instance (or now, while still executing).
    pub fn exec_time(&self) -> Option<chrono::Duration> {
        let started = self.changed_at(RunState::Running)?;
        let end = self.ended_at().unwrap_or_else(Utc::now);
        Some(end - started)
    }

    /// Exit code recorded on the last entry, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.changes.last().and_then(|c| c.exit_code)
    }

    fn push(&mut self, change: StateChange) {
        self.changes.push(change);
    }
}

/// Failure detail attached to an instance in a failure state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub state: RunState,
}

/// One buffered line of process output, kept for `tail`-style access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Immutable copy of an instance, used for IPC responses, events and
/// history rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub job_id: String,
    pub instance_id: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    pub state: RunState,
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub error_output: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default)]
    pub user_params: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latch: Option<String>,
    /// Forward-compatible extension fields; empty for records that predate
    /// the column.
    #[serde(default)]
    pub misc: BTreeMap<String, serde_json::Value>,
}

impl InstanceSnapshot {
    pub fn exec_time(&self) -> Option<chrono::Duration> {
        self.lifecycle.exec_time()
    }
}

/// Capacities of the per-instance output buffers.
#[derive(Debug, Clone, Copy)]
pub struct OutputCapacity {
    /// Interleaved stdout/stderr tail ring.
    pub tail: usize,
    /// Stderr-only tail retained on snapshots as `error_output`.
    pub error_tail: usize,
}

impl Default for OutputCapacity {
    fn default() -> Self {
        Self {
            tail: 100,
            error_tail: 1000,
        }
    }
}

struct Core {
    lifecycle: Lifecycle,
    tracking: Option<String>,
    result: Option<String>,
    tail: VecDeque<TailLine>,
    error_output: VecDeque<String>,
    warnings: Vec<String>,
    error: Option<RunError>,
    misc: BTreeMap<String, serde_json::Value>,
}

/// A live job instance.
///
/// Owned exclusively by its supervision task while live; shared read
/// access (snapshots, tails) goes through the internal lock. At most one
/// state transition is in flight per instance at a time.
pub struct JobInstance {
    job: JobDefinition,
    instance_id: String,
    created: DateTime<Utc>,
    latch: Option<String>,
    user_params: BTreeMap<String, String>,
    capacity: OutputCapacity,
    bus: Arc<EventBus>,
    core: Mutex<Core>,
}

impl JobInstance {
    /// Create a new instance and perform the NONE -> CREATED transition,
    /// publishing it like any other.
    pub fn new(
        job: JobDefinition,
        latch: Option<String>,
        user_params: BTreeMap<String, String>,
        capacity: OutputCapacity,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let instance = Arc::new(Self {
            job,
            instance_id: new_instance_id(),
            created: Utc::now(),
            latch,
            user_params,
            capacity,
            bus,
            core: Mutex::new(Core {
                lifecycle: Lifecycle::default(),
                tracking: None,
                result: None,
                tail: VecDeque::new(),
                error_output: VecDeque::new(),
                warnings: Vec::new(),
                error: None,
                misc: BTreeMap::new(),
            }),
        });
        // NONE -> CREATED is always legal on a fresh lifecycle.
        let _ = instance.transition(RunState::Created);
        instance
    }

    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.job
    }

    pub fn latch(&self) -> Option<&str> {
        self.latch.as_deref()
    }

    pub fn state(&self) -> RunState {
        self.lock().lifecycle.state()
    }

    /// Attempt a state transition without an exit code.
    pub fn transition(&self, to: RunState) -> Result<RunState> {
        self.transition_with_exit(to, None)
    }

    /// Attempt a state transition, recording the observed exit code.
    ///
    /// On success the change is appended to the audit trail and the
    /// state-change event is delivered to all listeners before this call
    /// returns. A transition attempt from a terminal state fails with
    /// [`JobmonError::InvalidTransition`] and leaves the instance
    /// untouched; callers must treat that as a logic error.
    pub fn transition_with_exit(&self, to: RunState, exit_code: Option<i32>) -> Result<RunState> {
        let mut core = self.lock();
        let from = core.lifecycle.state();
        if !from.can_transition_to(to) {
            return Err(JobmonError::InvalidTransition {
                instance: self.instance_id.clone(),
                from,
            });
        }
        // Clamp so the audit trail stays monotonic even if the wall clock
        // steps backwards between transitions.
        let at = core
            .lifecycle
            .changes()
            .last()
            .map_or_else(Utc::now, |last| Utc::now().max(last.at));
        core.lifecycle.push(StateChange {
            state: to,
            at,
            exit_code,
        });
        let event = JobEvent::StateChanged {
            snapshot: self.snapshot_locked(&core),
            old_state: from,
            new_state: to,
            at,
        };
        // Published under the lock: listeners see this instance's
        // transitions in exactly the order they occur.
        self.bus.publish(&event);
        Ok(from)
    }

    /// Record one line of child output: feeds the tail rings and publishes
    /// an output event.
    pub fn record_output(&self, stream: OutputStream, line: String) {
        let mut core = self.lock();
        if core.tail.len() == self.capacity.tail {
            core.tail.pop_front();
        }
        core.tail.push_back(TailLine {
            stream,
            text: line.clone(),
        });
        if stream == OutputStream::Stderr {
            if core.error_output.len() == self.capacity.error_tail {
                core.error_output.pop_front();
            }
            core.error_output.push_back(line.clone());
        }
        let event = JobEvent::Output {
            job_id: self.job.job_id.clone(),
            instance_id: self.instance_id.clone(),
            stream,
            chunk: line,
        };
        self.bus.publish(&event);
    }

    /// Most recent buffered output lines, oldest first.
    pub fn tail(&self) -> Vec<TailLine> {
        self.lock().tail.iter().cloned().collect()
    }

    /// Free-form progress metadata updated by a running process.
    pub fn set_tracking(&self, tracking: impl Into<String>) {
        self.lock().tracking = Some(tracking.into());
    }

    /// Free-form success payload.
    pub fn set_result(&self, result: impl Into<String>) {
        self.lock().result = Some(result.into());
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        self.lock().warnings.push(warning.into());
    }

    /// Failure detail; recorded before the terminal transition so the
    /// terminal snapshot carries it.
    pub fn set_error(&self, message: impl Into<String>, state: RunState) {
        self.lock().error = Some(RunError {
            message: message.into(),
            state,
        });
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let core = self.lock();
        self.snapshot_locked(&core)
    }

    fn snapshot_locked(&self, core: &Core) -> InstanceSnapshot {
        InstanceSnapshot {
            job_id: self.job.job_id.clone(),
            instance_id: self.instance_id.clone(),
            created: self.created,
            ended: core.lifecycle.ended_at(),
            state: core.lifecycle.state(),
            lifecycle: core.lifecycle.clone(),
            tracking: core.tracking.clone(),
            result: core.result.clone(),
            error_output: core.error_output.iter().cloned().collect(),
            warnings: core.warnings.clone(),
            error: core.error.clone(),
            user_params: self.user_params.clone(),
            parameters: self.job.params.clone(),
            latch: self.latch.clone(),
            misc: core.misc.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}
