// src/errors.rs

//! Crate-wide error taxonomy.
//!
//! The variants mirror the failure conditions the runtime distinguishes:
//! transition attempts out of terminal states are programming errors,
//! selector misses are reported to the caller, protocol decode problems
//! never take the server down, and persistence failures stay isolated from
//! state-machine correctness.

use thiserror::Error;

use crate::job::state::RunState;

#[derive(Error, Debug)]
pub enum JobmonError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid transition: instance '{instance}' is terminal in state {from}")]
    InvalidTransition { instance: String, from: RunState },

    #[error("no live instance matches {0}")]
    NotFound(String),

    #[error("selector {selector} matches {count} live instances")]
    Ambiguous { selector: String, count: usize },

    #[error("failed to start process for job '{job}': {reason}")]
    ProcessStart { job: String, reason: String },

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, JobmonError>;
