// src/job/selector.rs

//! Instance selectors.
//!
//! Selectors are a small closed set of variants rather than free-form
//! string matching, so "no match" and "more than one match" outcomes stay
//! exhaustively checkable at the call sites that need exactly one target.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::instance::InstanceSnapshot;

/// Selects live instances by one of their identifying attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "kebab-case")]
pub enum InstanceSelector {
    /// All instances of a job.
    Job(String),
    /// A single instance by its exact instance id.
    Instance(String),
    /// All instances created with (and still holding) a latch token.
    Latch(String),
}

impl InstanceSelector {
    pub fn matches(&self, snapshot: &InstanceSnapshot) -> bool {
        match self {
            InstanceSelector::Job(job_id) => snapshot.job_id == *job_id,
            InstanceSelector::Instance(instance_id) => snapshot.instance_id == *instance_id,
            InstanceSelector::Latch(token) => snapshot.latch.as_deref() == Some(token),
        }
    }
}

impl fmt::Display for InstanceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceSelector::Job(job_id) => write!(f, "job '{job_id}'"),
            InstanceSelector::Instance(instance_id) => write!(f, "instance '{instance_id}'"),
            InstanceSelector::Latch(token) => write!(f, "latch '{token}'"),
        }
    }
}
