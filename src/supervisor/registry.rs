// src/supervisor/registry.rs

//! Live instance registry.
//!
//! Tracks every instance currently supervised by this process, together
//! with its control channel. An instance stays queryable here until its
//! terminal snapshot has been handed to the history store (or immediately
//! evicted when persistence is disabled).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::errors::{JobmonError, Result};
use crate::job::instance::{InstanceSnapshot, JobInstance};
use crate::job::selector::InstanceSelector;

/// Control orders a supervision task reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOrder {
    /// Requested stop: termination signal, non-failure outcome.
    Stop,
    /// Interrupt: termination propagated from an out-of-band signal,
    /// failure-classified outcome.
    Interrupt,
}

/// A registry entry: the shared instance plus the sender feeding its
/// supervision task.
#[derive(Clone)]
pub struct LiveEntry {
    pub instance: Arc<JobInstance>,
    pub ctrl: mpsc::Sender<ControlOrder>,
}

impl std::fmt::Debug for LiveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveEntry")
            .field("instance_id", &self.instance.instance_id())
            .finish()
    }
}

/// All live instances of this process, keyed by instance id.
#[derive(Default)]
pub struct LiveRegistry {
    entries: Mutex<HashMap<String, LiveEntry>>,
}

impl LiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: LiveEntry) {
        self.lock()
            .insert(entry.instance.instance_id().to_string(), entry);
    }

    pub fn remove(&self, instance_id: &str) -> Option<LiveEntry> {
        self.lock().remove(instance_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<LiveEntry> {
        self.lock().get(instance_id).cloned()
    }

    pub fn all(&self) -> Vec<LiveEntry> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshots of all live instances, optionally filtered by job id.
    ///
    /// An unknown job filter yields an empty list, not an error.
    pub fn snapshots(&self, job_filter: Option<&str>) -> Vec<InstanceSnapshot> {
        self.lock()
            .values()
            .map(|e| e.instance.snapshot())
            .filter(|s| job_filter.is_none_or(|job_id| s.job_id == job_id))
            .collect()
    }

    /// All entries matched by a selector.
    pub fn matching(&self, selector: &InstanceSelector) -> Vec<LiveEntry> {
        self.lock()
            .values()
            .filter(|e| selector.matches(&e.instance.snapshot()))
            .cloned()
            .collect()
    }

    /// Resolve a selector that must identify exactly one live instance.
    pub fn resolve_one(&self, selector: &InstanceSelector) -> Result<LiveEntry> {
        let mut matches = self.matching(selector);
        match matches.len() {
            0 => Err(JobmonError::NotFound(selector.to_string())),
            1 => Ok(matches.remove(0)),
            count => Err(JobmonError::Ambiguous {
                selector: selector.to_string(),
                count,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LiveEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
