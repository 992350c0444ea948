// src/events/mod.rs

//! Event types and the in-process listener registry.
//!
//! Two logical kinds of events flow through the runtime:
//! - state-change events, published synchronously by every accepted
//!   instance transition,
//! - output events, published for every stdout/stderr chunk a supervised
//!   process emits.
//!
//! Both are fanned out by [`EventBus`] to local listeners (built-in,
//! plugin-registered, or IPC subscription forwarders) in publish order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::instance::InstanceSnapshot;
use crate::job::state::RunState;

pub mod bus;

pub use bus::{EventBus, ListenerId};

/// Which stream of the child process a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// An event about one job instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum JobEvent {
    /// An accepted state transition, carrying the snapshot taken right
    /// after the transition was appended to the audit trail.
    StateChanged {
        snapshot: InstanceSnapshot,
        old_state: RunState,
        new_state: RunState,
        at: DateTime<Utc>,
    },
    /// A chunk of process output.
    Output {
        job_id: String,
        instance_id: String,
        stream: OutputStream,
        chunk: String,
    },
}

impl JobEvent {
    /// The job this event belongs to, used for subscription filtering.
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::StateChanged { snapshot, .. } => &snapshot.job_id,
            JobEvent::Output { job_id, .. } => job_id,
        }
    }

    /// The instance this event belongs to.
    pub fn instance_id(&self) -> &str {
        match self {
            JobEvent::StateChanged { snapshot, .. } => &snapshot.instance_id,
            JobEvent::Output { instance_id, .. } => instance_id,
        }
    }
}
