// src/job/mod.rs

//! Job definitions, instances and their state model.
//!
//! A [`JobDefinition`] names a unit of work (typically a crontab entry)
//! and is immutable. Each run of a job produces a [`instance::JobInstance`]
//! with its own identity and append-only state history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod instance;
pub mod selector;
pub mod state;

pub use instance::{InstanceSnapshot, JobInstance, Lifecycle, RunError, StateChange, TailLine};
pub use selector::InstanceSelector;
pub use state::RunState;

/// Stable identifier of a job; a job may have arbitrarily many instances
/// over time.
pub type JobId = String;

/// Immutable definition of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_id: JobId,
    /// Program to execute (argv\[0\]).
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Opaque parameters supplied at invocation, persisted verbatim.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl JobDefinition {
    pub fn new(job_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            command: command.into(),
            args: Vec::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Generate a fresh instance id.
///
/// Ids are lowercase hex without separators and are never reused.
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
