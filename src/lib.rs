// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod events;
pub mod history;
pub mod ipc;
pub mod job;
pub mod latch;
pub mod logging;
pub mod supervisor;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cli::{CliArgs, Command};
use crate::config::AppConfig;
use crate::errors::Result;
use crate::events::{EventBus, JobEvent};
use crate::history::HistoryStore;
use crate::ipc::IpcClient;
use crate::job::JobDefinition;
use crate::job::instance::{InstanceSnapshot, JobInstance};
use crate::latch::LatchCoordinator;
use crate::supervisor::{
    LaunchSpec, LiveRegistry, ProcessSupervisor, spawn_signal_watcher,
};

/// The assembled runtime of one run process.
///
/// Wires together the live registry, latch coordinator, event bus,
/// history store, IPC server and the OS signal watcher. Plugin listeners
/// subscribe on [`bus`](Self::bus) between construction and the first
/// [`launch`](Self::launch), which guarantees they observe the same event
/// stream as built-in listeners.
pub struct JobRuntime {
    config: AppConfig,
    supervisor: ProcessSupervisor,
    server: ipc::IpcServerHandle,
    signal_task: JoinHandle<()>,
}

impl JobRuntime {
    /// Build the runtime: open the history store (if enabled), bind this
    /// process's API socket and start the signal watcher.
    pub async fn start(config: &AppConfig) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(LiveRegistry::new());
        let latches = Arc::new(LatchCoordinator::new());
        let history = if config.persistence.enabled {
            Some(Arc::new(HistoryStore::open(
                &config.persistence.database_path(),
                config.persistence.retention()?,
            )?))
        } else {
            None
        };
        let supervisor = ProcessSupervisor::new(
            registry.clone(),
            latches,
            bus,
            history,
            config.run.options(),
        );
        let server = ipc::serve(&config.sockets_dir(), supervisor.clone()).await?;
        let signal_task = spawn_signal_watcher(registry);
        Ok(Self {
            config: config.clone(),
            supervisor,
            server,
            signal_task,
        })
    }

    /// Event bus of this runtime; subscribe here before launching to see
    /// every event.
    pub fn bus(&self) -> &Arc<EventBus> {
        self.supervisor.bus()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Path of this process's API socket.
    pub fn socket_path(&self) -> &Path {
        self.server.socket_path()
    }

    /// Create an instance and start supervising it.
    ///
    /// Whether the job is disabled is read from configuration here, once,
    /// and never re-evaluated.
    pub fn launch(
        &self,
        def: JobDefinition,
        latch: Option<String>,
        user_params: BTreeMap<String, String>,
    ) -> (Arc<JobInstance>, JoinHandle<Result<()>>) {
        let disabled = self.config.is_disabled(&def.job_id);
        self.supervisor.start(
            def,
            LaunchSpec {
                latch,
                user_params,
                disabled,
            },
        )
    }

    /// Tear down the IPC server and the signal watcher.
    pub async fn shutdown(self) {
        self.server.shutdown().await;
        self.signal_task.abort();
    }
}

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs, config: AppConfig) -> Result<ExitCode> {
    match args.command {
        Command::Run {
            job_id,
            latch,
            params,
            command,
        } => cmd_run(config, job_id, latch, params, command).await,
        Command::Ps { job } => cmd_ps(&config, job.as_deref()).await,
        Command::Stop { target } => cmd_stop(&config, &target).await,
        Command::Release { latch } => cmd_release(&config, &latch).await,
        Command::Tail { target } => cmd_tail(&config, &target).await,
        Command::History { job, limit } => cmd_history(&config, job.as_deref(), limit),
        Command::Listen { job } => cmd_listen(&config, job.as_deref()).await,
    }
}

async fn cmd_run(
    config: AppConfig,
    job_id: String,
    latch: Option<String>,
    params: Vec<(String, String)>,
    command: Vec<String>,
) -> Result<ExitCode> {
    let mut parts = command.into_iter();
    let program = parts
        .next()
        .ok_or_else(|| errors::JobmonError::ConfigError("empty command".to_string()))?;
    let def = JobDefinition::new(job_id, program).with_args(parts);
    let user_params: BTreeMap<String, String> = params.into_iter().collect();

    let runtime = JobRuntime::start(&config).await?;
    let (instance, handle) = runtime.launch(def, latch, user_params);
    let supervision = match handle.await {
        Ok(result) => result,
        Err(e) => Err(anyhow!("supervision task failed: {e}").into()),
    };
    runtime.shutdown().await;

    let snapshot = instance.snapshot();
    info!(
        job = %snapshot.job_id,
        instance = %snapshot.instance_id,
        state = %snapshot.state,
        "instance finished"
    );
    print_final_state(&snapshot);
    // A persistence failure is reported here, once, to the initiating
    // caller; the instance itself is already terminally resolved.
    supervision?;

    if snapshot.state.is_failure() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn cmd_ps(config: &AppConfig, job: Option<&str>) -> Result<ExitCode> {
    let client = IpcClient::new(config.sockets_dir());
    let instances = client.list_instances(job).await?;
    print_instances(&instances);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_stop(config: &AppConfig, target: &cli::Target) -> Result<ExitCode> {
    let selector = target.selector()?;
    let client = IpcClient::new(config.sockets_dir());
    let stopped = client.stop(&selector).await?;
    for instance_id in stopped {
        println!("stop requested: {instance_id}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_release(config: &AppConfig, latch: &str) -> Result<ExitCode> {
    let client = IpcClient::new(config.sockets_dir());
    let count = client.release(latch).await?;
    println!("released {count} instance(s)");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_tail(config: &AppConfig, target: &cli::Target) -> Result<ExitCode> {
    let selector = target.selector()?;
    let client = IpcClient::new(config.sockets_dir());
    for tail in client.tail(&selector).await? {
        println!("{} / {}:", tail.job_id, tail.instance_id);
        for line in tail.lines {
            match line.stream {
                events::OutputStream::Stdout => println!("  {}", line.text),
                events::OutputStream::Stderr => println!("! {}", line.text),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_history(config: &AppConfig, job: Option<&str>, limit: i64) -> Result<ExitCode> {
    if !config.persistence.enabled {
        return Err(errors::JobmonError::ConfigError(
            "persistence is disabled; no history available".to_string(),
        ));
    }
    let store = HistoryStore::open(
        &config.persistence.database_path(),
        config.persistence.retention()?,
    )?;
    let instances = store.read_instances(job, limit)?;
    print_instances(&instances);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_listen(config: &AppConfig, job: Option<&str>) -> Result<ExitCode> {
    let client = IpcClient::new(config.sockets_dir());
    let mut events = client.subscribe(job).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_final_state(snapshot: &InstanceSnapshot) {
    println!(
        "{} {} -> {}",
        snapshot.job_id, snapshot.instance_id, snapshot.state
    );
    if let Some(error) = &snapshot.error {
        println!("  error: {}", error.message);
    }
    for warning in &snapshot.warnings {
        println!("  warning: {warning}");
    }
}

fn print_instances(instances: &[InstanceSnapshot]) {
    println!("{:<20} {:<34} {:<12} {}", "JOB", "INSTANCE", "STATE", "CREATED");
    for snapshot in instances {
        println!(
            "{:<20} {:<34} {:<12} {}",
            snapshot.job_id,
            snapshot.instance_id,
            snapshot.state.to_string(),
            snapshot.created.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

fn print_event(event: &JobEvent) {
    match event {
        JobEvent::StateChanged {
            snapshot,
            old_state,
            new_state,
            at,
        } => {
            println!(
                "{} {} {} {} -> {}",
                at.format("%H:%M:%S%.3f"),
                snapshot.job_id,
                snapshot.instance_id,
                old_state,
                new_state,
            );
        }
        JobEvent::Output {
            job_id,
            instance_id,
            stream,
            chunk,
        } => {
            let marker = match stream {
                events::OutputStream::Stdout => ' ',
                events::OutputStream::Stderr => '!',
            };
            println!("{job_id} {instance_id} {marker} {chunk}");
        }
    }
}
