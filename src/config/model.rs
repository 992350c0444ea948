// src/config/model.rs

//! Configuration value object.
//!
//! Loaded once at process startup and passed by reference into every
//! component constructor; components never reach into ambient global
//! state. All sections are optional and have defaults, so an absent
//! config file is equivalent to an empty one.
//!
//! ```toml
//! disabled_jobs = ["nightly-report"]
//!
//! [log]
//! enabled = true
//! level = "info"
//!
//! [run]
//! stop_grace_secs = 10
//! tail_capacity = 100
//!
//! [persistence]
//! enabled = true
//! max_age = "P30D"
//! max_records = -1
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{JobmonError, Result};
use crate::history::RetentionPolicy;
use crate::job::instance::OutputCapacity;
use crate::supervisor::RunOptions;

/// Top-level configuration as read from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Jobs that must not execute; checked once at instance creation.
    #[serde(default)]
    pub disabled_jobs: Vec<String>,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl AppConfig {
    pub fn is_disabled(&self, job_id: &str) -> bool {
        self.disabled_jobs.iter().any(|j| j == job_id)
    }

    /// Directory holding the API sockets of live run processes.
    pub fn sockets_dir(&self) -> PathBuf {
        self.run
            .sockets_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("jobmon-sockets"))
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
        }
    }
}

/// `[run]` section: supervision tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Grace period for a requested stop before escalating to SIGKILL.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Interleaved stdout/stderr tail ring per instance.
    #[serde(default = "default_tail_capacity")]
    pub tail_capacity: usize,
    /// Stderr tail retained on snapshots.
    #[serde(default = "default_error_tail_capacity")]
    pub error_tail_capacity: usize,
    /// Override of the sockets directory; defaults to
    /// `$TMPDIR/jobmon-sockets`.
    #[serde(default)]
    pub sockets_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace_secs(),
            tail_capacity: default_tail_capacity(),
            error_tail_capacity: default_error_tail_capacity(),
            sockets_dir: None,
        }
    }
}

impl RunConfig {
    pub fn options(&self) -> RunOptions {
        RunOptions {
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            output_capacity: OutputCapacity {
                tail: self.tail_capacity.max(1),
                error_tail: self.error_tail_capacity.max(1),
            },
        }
    }
}

/// `[persistence]` section: history store location and retention.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Database file; defaults to `jobmon-history.sqlite` in the current
    /// working directory.
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// ISO-8601 duration, e.g. `"P30D"` or `"PT12H"`.
    #[serde(default)]
    pub max_age: Option<String>,
    /// −1 disables the limit, 0 retains nothing, positive N keeps the N
    /// most-recently-ended records.
    #[serde(default = "default_max_records")]
    pub max_records: i64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database: None,
            max_age: None,
            max_records: default_max_records(),
        }
    }
}

impl PersistenceConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| PathBuf::from("jobmon-history.sqlite"))
    }

    pub fn retention(&self) -> Result<RetentionPolicy> {
        let max_age = self
            .max_age
            .as_deref()
            .map(parse_iso_duration)
            .transpose()?;
        Ok(RetentionPolicy {
            max_age,
            max_records: self.max_records,
        })
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_tail_capacity() -> usize {
    100
}

fn default_error_tail_capacity() -> usize {
    1000
}

fn default_max_records() -> i64 {
    -1
}

/// Parse an ISO-8601 duration of the form `PnW` or `PnDTnHnMnS`.
///
/// Calendar-dependent designators (years, months) are rejected: retention
/// cutoffs need an exact length.
pub fn parse_iso_duration(raw: &str) -> Result<chrono::Duration> {
    let err = |msg: &str| JobmonError::ConfigError(format!("invalid ISO-8601 duration '{raw}': {msg}"));

    let mut chars = raw.trim().chars().peekable();
    if chars.next().is_none_or(|c| c.to_ascii_uppercase() != 'P') {
        return Err(err("must start with 'P'"));
    }

    let mut seconds: i64 = 0;
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_component = false;

    for c in chars {
        match c {
            'T' | 't' => {
                if !number.is_empty() {
                    return Err(err("dangling number before 'T'"));
                }
                in_time = true;
            }
            '0'..='9' => number.push(c),
            designator => {
                let value: i64 = number
                    .parse()
                    .map_err(|_| err("designator without a number"))?;
                number.clear();
                saw_component = true;
                let factor = match (designator.to_ascii_uppercase(), in_time) {
                    ('W', false) => 7 * 24 * 3600,
                    ('D', false) => 24 * 3600,
                    ('H', true) => 3600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    ('Y', _) | ('M', false) => {
                        return Err(err("calendar designators are not supported"));
                    }
                    _ => return Err(err("unexpected designator")),
                };
                seconds = seconds
                    .checked_add(value.checked_mul(factor).ok_or_else(|| err("overflow"))?)
                    .ok_or_else(|| err("overflow"))?;
            }
        }
    }
    if !number.is_empty() {
        return Err(err("trailing number without designator"));
    }
    if !saw_component {
        return Err(err("no components"));
    }
    Ok(chrono::Duration::seconds(seconds))
}
