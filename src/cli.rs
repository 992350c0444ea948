// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! The CLI is a thin boundary layer: it builds job definitions and
//! selectors, and renders responses; all semantics live in the runtime
//! modules.

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::errors::{JobmonError, Result};
use crate::job::selector::InstanceSelector;

/// Command-line arguments for `jobmon`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "jobmon",
    version,
    about = "Run and monitor job instances on this host.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `jobmon.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "jobmon.toml", global = true)]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `JOBMON_LOG`, the `[log]` config section or a default
    /// level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a command as a supervised instance of a job.
    Run {
        /// Stable job id the instance belongs to.
        job_id: String,

        /// Park the instance in PENDING until this latch token is
        /// released (`jobmon release <TOKEN>`).
        #[arg(long, value_name = "TOKEN")]
        latch: Option<String>,

        /// Additional `key=value` parameters stored with the instance.
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// The command to execute, given after `--`.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// List live instances across all run processes.
    Ps {
        /// Only show instances of this job.
        job: Option<String>,
    },

    /// Stop one live instance (non-failure outcome).
    Stop {
        #[command(flatten)]
        target: Target,
    },

    /// Release every instance pending on a latch token.
    Release {
        /// The latch token to release.
        latch: String,
    },

    /// Print the buffered output of matching instances.
    Tail {
        #[command(flatten)]
        target: Target,
    },

    /// Show finished instances from the history database.
    History {
        /// Only show instances of this job.
        job: Option<String>,

        /// Maximum number of records to show (most recent first).
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Stream state and output events of live instances.
    Listen {
        /// Only events of this job.
        job: Option<String>,
    },
}

/// Instance selection shared by `stop` and `tail`.
#[derive(Debug, Clone, Args)]
pub struct Target {
    /// Select all instances of this job id.
    pub job: Option<String>,

    /// Select a single instance by its instance id.
    #[arg(long, value_name = "ID", conflicts_with = "job")]
    pub instance: Option<String>,

    /// Select instances created with this latch token.
    #[arg(long, value_name = "TOKEN", conflicts_with_all = ["job", "instance"])]
    pub latch: Option<String>,
}

impl Target {
    pub fn selector(&self) -> Result<InstanceSelector> {
        if let Some(instance_id) = &self.instance {
            return Ok(InstanceSelector::Instance(instance_id.clone()));
        }
        if let Some(token) = &self.latch {
            return Ok(InstanceSelector::Latch(token.clone()));
        }
        if let Some(job_id) = &self.job {
            return Ok(InstanceSelector::Job(job_id.clone()));
        }
        Err(JobmonError::ConfigError(
            "specify a job id, --instance or --latch".to_string(),
        ))
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_key_val(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
