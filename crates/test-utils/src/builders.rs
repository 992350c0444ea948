#![allow(dead_code)]

use std::path::Path;

use jobmon::config::AppConfig;
use jobmon::job::JobDefinition;

/// Builder for `AppConfig` to simplify test setup.
///
/// Defaults to persistence disabled and a short stop grace period so that
/// tests neither touch the filesystem nor wait the production ten seconds.
pub struct ConfigBuilder {
    config: AppConfig,
}

impl ConfigBuilder {
    pub fn new(sockets_dir: &Path) -> Self {
        let mut config = AppConfig::default();
        config.run.sockets_dir = Some(sockets_dir.to_path_buf());
        config.run.stop_grace_secs = 1;
        config.persistence.enabled = false;
        Self { config }
    }

    pub fn with_database(mut self, path: &Path) -> Self {
        self.config.persistence.enabled = true;
        self.config.persistence.database = Some(path.to_path_buf());
        self
    }

    pub fn with_max_records(mut self, max_records: i64) -> Self {
        self.config.persistence.max_records = max_records;
        self
    }

    pub fn with_max_age(mut self, max_age: &str) -> Self {
        self.config.persistence.max_age = Some(max_age.to_string());
        self
    }

    pub fn with_disabled_job(mut self, job_id: &str) -> Self {
        self.config.disabled_jobs.push(job_id.to_string());
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

/// A job that prints `hello` and exits 0.
pub fn echo_job(job_id: &str) -> JobDefinition {
    JobDefinition::new(job_id, "echo").with_args(["hello"])
}

/// A job that exits with the given code.
pub fn exit_job(job_id: &str, code: i32) -> JobDefinition {
    JobDefinition::new(job_id, "sh").with_args(["-c".to_string(), format!("exit {code}")])
}

/// A job that sleeps long enough to be observed RUNNING.
pub fn sleep_job(job_id: &str, seconds: u32) -> JobDefinition {
    JobDefinition::new(job_id, "sleep").with_args([seconds.to_string()])
}

/// A job that writes to both streams, then sleeps.
pub fn chatty_job(job_id: &str) -> JobDefinition {
    JobDefinition::new(job_id, "sh").with_args([
        "-c",
        "echo out-line; echo err-line >&2; sleep 30",
    ])
}

/// A job that ignores SIGTERM, for stop-escalation tests.
pub fn term_ignoring_job(job_id: &str) -> JobDefinition {
    JobDefinition::new(job_id, "sh").with_args(["-c", "trap '' TERM; sleep 30"])
}

/// A job that exits 0 on SIGINT, for interrupt-classification tests.
pub fn int_exits_zero_job(job_id: &str) -> JobDefinition {
    JobDefinition::new(job_id, "sh").with_args(["-c", "trap 'exit 0' INT; sleep 30"])
}

/// A job whose command does not exist, for spawn-failure tests.
pub fn missing_binary_job(job_id: &str) -> JobDefinition {
    JobDefinition::new(job_id, "/nonexistent/jobmon-test-binary")
}
