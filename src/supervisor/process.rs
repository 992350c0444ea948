// src/supervisor/process.rs

//! Process supervision.
//!
//! [`ProcessSupervisor`] owns the OS process backing a RUNNING instance:
//! it spawns the child, streams its output into the instance's tail
//! buffers and the event bus, and maps the observed exit (or signal
//! intent) onto the final state-machine transition.
//!
//! Stop/interrupt requests arrive as [`ControlOrder`]s over the
//! per-instance control channel, so the signal-handling path only ever
//! sets intent; it never unwinds a supervision frame.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::{JobmonError, Result};
use crate::events::{EventBus, OutputStream};
use crate::history::HistoryStore;
use crate::job::JobDefinition;
use crate::job::instance::{JobInstance, OutputCapacity};
use crate::job::state::RunState;
use crate::latch::LatchCoordinator;

use super::registry::{ControlOrder, LiveEntry, LiveRegistry};

/// Supervision tuning, taken from configuration once at startup.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// How long a requested stop may take before escalating to SIGKILL.
    pub stop_grace: Duration,
    pub output_capacity: OutputCapacity,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            output_capacity: OutputCapacity::default(),
        }
    }
}

/// Per-launch inputs that are not part of the job definition.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Park the instance in PENDING until this token is released.
    pub latch: Option<String>,
    /// Opaque caller-supplied map, persisted verbatim.
    pub user_params: BTreeMap<String, String>,
    /// Whether configuration marks the job disabled; checked once at
    /// creation, never re-evaluated.
    pub disabled: bool,
}

/// Spawns and drives the supervision task of each instance.
#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: Arc<LiveRegistry>,
    latches: Arc<LatchCoordinator>,
    bus: Arc<EventBus>,
    history: Option<Arc<HistoryStore>>,
    options: RunOptions,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<LiveRegistry>,
        latches: Arc<LatchCoordinator>,
        bus: Arc<EventBus>,
        history: Option<Arc<HistoryStore>>,
        options: RunOptions,
    ) -> Self {
        Self {
            registry,
            latches,
            bus,
            history,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<LiveRegistry> {
        &self.registry
    }

    pub fn latches(&self) -> &Arc<LatchCoordinator> {
        &self.latches
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Create an instance and spawn its supervision task.
    ///
    /// The instance is registered before this returns; the returned handle
    /// resolves once the instance is terminal and (if enabled) its history
    /// record has been attempted. A persistence failure is the only error
    /// the handle carries; the instance is terminally resolved in memory
    /// regardless.
    pub fn start(
        &self,
        def: JobDefinition,
        launch: LaunchSpec,
    ) -> (Arc<JobInstance>, JoinHandle<Result<()>>) {
        let LaunchSpec {
            latch,
            user_params,
            disabled,
        } = launch;
        let instance = JobInstance::new(
            def,
            latch,
            user_params,
            self.options.output_capacity,
            self.bus.clone(),
        );
        let (ctrl_tx, ctrl_rx) = mpsc::channel(4);
        self.registry.insert(LiveEntry {
            instance: instance.clone(),
            ctrl: ctrl_tx,
        });

        let supervisor = self.clone();
        let task_instance = instance.clone();
        let handle = tokio::spawn(async move {
            supervise(supervisor, task_instance, ctrl_rx, disabled).await
        });
        (instance, handle)
    }

    /// Ask a live instance to stop (non-failure outcome). Fire-and-forget:
    /// returns once the order is accepted, not once the instance is
    /// terminal.
    pub fn request_stop(&self, instance_id: &str) -> Result<()> {
        self.send_order(instance_id, ControlOrder::Stop)
    }

    /// Propagate an interrupt to a live instance (failure-classified
    /// outcome). Same fire-and-forget contract as [`request_stop`].
    ///
    /// [`request_stop`]: Self::request_stop
    pub fn request_interrupt(&self, instance_id: &str) -> Result<()> {
        self.send_order(instance_id, ControlOrder::Interrupt)
    }

    /// Whether the instance is still tracked and not yet terminal.
    pub fn is_alive(&self, instance_id: &str) -> bool {
        self.registry
            .get(instance_id)
            .is_some_and(|e| !e.instance.state().is_terminal())
    }

    fn send_order(&self, instance_id: &str, order: ControlOrder) -> Result<()> {
        let entry = self
            .registry
            .get(instance_id)
            .ok_or_else(|| JobmonError::NotFound(format!("instance '{instance_id}'")))?;
        if let Err(e) = entry.ctrl.try_send(order) {
            // The supervision task is already winding down; the instance
            // will reach a terminal state without this order.
            debug!(instance = instance_id, ?order, error = %e, "control order not delivered");
        }
        Ok(())
    }
}

/// Outcome of waiting for the child, before it is mapped to a transition.
struct ExitClass {
    state: RunState,
    exit_code: Option<i32>,
    error: Option<String>,
}

async fn supervise(
    sup: ProcessSupervisor,
    instance: Arc<JobInstance>,
    mut ctrl_rx: mpsc::Receiver<ControlOrder>,
    disabled: bool,
) -> Result<()> {
    if disabled {
        info!(job = instance.job_id(), instance = instance.instance_id(), "job is disabled");
        instance.transition(RunState::Disabled)?;
        return finalize(&sup, &instance);
    }

    if let Some(token) = instance.latch().map(str::to_string) {
        // Register before the PENDING transition so a release arriving in
        // between is not lost.
        let release_rx = sup.latches.register(&token, instance.instance_id());
        instance.transition(RunState::Pending)?;
        tokio::select! {
            released = release_rx => {
                if released.is_err() {
                    warn!(
                        instance = instance.instance_id(),
                        "latch coordinator went away while pending"
                    );
                    instance.transition(RunState::Interrupted)?;
                    return finalize(&sup, &instance);
                }
                // Released; fall through to process start.
            }
            order = ctrl_rx.recv() => {
                sup.latches.forget(&token, instance.instance_id());
                let state = match order {
                    Some(ControlOrder::Interrupt) => RunState::Interrupted,
                    // A closed control channel while pending means the
                    // runtime is shutting the instance down.
                    Some(ControlOrder::Stop) | None => RunState::Stopped,
                };
                info!(
                    instance = instance.instance_id(),
                    state = %state,
                    "pending instance terminated before start"
                );
                instance.transition(state)?;
                return finalize(&sup, &instance);
            }
        }
    }

    let mut child = match spawn_child(instance.definition()) {
        Ok(child) => child,
        Err(e) => {
            let err = JobmonError::ProcessStart {
                job: instance.job_id().to_string(),
                reason: e.to_string(),
            };
            warn!(job = instance.job_id(), error = %err, "process start failed");
            instance.set_error(err.to_string(), RunState::Failed);
            instance.transition(RunState::Failed)?;
            return finalize(&sup, &instance);
        }
    };

    instance.transition(RunState::Running)?;
    info!(
        job = instance.job_id(),
        instance = instance.instance_id(),
        pid = child.id(),
        "process started"
    );

    let out_reader = child
        .stdout
        .take()
        .map(|out| spawn_output_reader(instance.clone(), OutputStream::Stdout, out));
    let err_reader = child
        .stderr
        .take()
        .map(|err| spawn_output_reader(instance.clone(), OutputStream::Stderr, err));

    let exit = wait_for_exit(&sup, &instance, &mut child, &mut ctrl_rx).await;

    // Let the readers drain the pipes so the terminal snapshot carries the
    // complete output tail. They end at EOF; the timeout only guards the
    // case where no exit was observable.
    for reader in [out_reader, err_reader].into_iter().flatten() {
        let _ = timeout(Duration::from_secs(1), reader).await;
    }

    if let Some(message) = &exit.error {
        instance.set_error(message.clone(), exit.state);
    }
    info!(
        job = instance.job_id(),
        instance = instance.instance_id(),
        state = %exit.state,
        exit_code = exit.exit_code,
        "process exited"
    );
    instance.transition_with_exit(exit.state, exit.exit_code)?;
    finalize(&sup, &instance)
}

/// Wait until the child exits, reacting to control orders on the way.
///
/// Stop orders send SIGTERM and enforce the grace period, escalating to
/// SIGKILL so the exit is always observed and classified STOPPED.
/// Interrupt orders send SIGINT and keep waiting: a child that ignores the
/// signal leaves the instance RUNNING indefinitely, which is a documented
/// limitation rather than a forced classification.
async fn wait_for_exit(
    sup: &ProcessSupervisor,
    instance: &Arc<JobInstance>,
    child: &mut Child,
    ctrl_rx: &mut mpsc::Receiver<ControlOrder>,
) -> ExitClass {
    let mut intent: Option<ControlOrder> = None;

    loop {
        tokio::select! {
            status = child.wait() => {
                return classify_exit(status, intent);
            }
            order = ctrl_rx.recv() => {
                let Some(order) = order else {
                    // Control channel closed; nothing left to react to.
                    return classify_exit(child.wait().await, intent);
                };
                if intent.is_none() {
                    intent = Some(order);
                }
                signal_child(child, order);
                if order == ControlOrder::Stop {
                    return stop_with_grace(sup, instance, child, intent).await;
                }
                // Interrupt: keep waiting for the exit.
            }
        }
    }
}

/// Grace-period wait after a stop signal, escalating to SIGKILL.
async fn stop_with_grace(
    sup: &ProcessSupervisor,
    instance: &Arc<JobInstance>,
    child: &mut Child,
    intent: Option<ControlOrder>,
) -> ExitClass {
    match timeout(sup.options.stop_grace, child.wait()).await {
        Ok(status) => classify_exit(status, intent),
        Err(_) => {
            warn!(
                instance = instance.instance_id(),
                grace = ?sup.options.stop_grace,
                "stop grace period elapsed; escalating to SIGKILL"
            );
            if let Err(e) = child.start_kill() {
                // Exited between the timeout and the kill.
                debug!(instance = instance.instance_id(), error = %e, "kill after grace failed");
            }
            classify_exit(child.wait().await, intent)
        }
    }
}

fn classify_exit(
    status: std::io::Result<std::process::ExitStatus>,
    intent: Option<ControlOrder>,
) -> ExitClass {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            // The process disappeared without an observable exit.
            return ExitClass {
                state: RunState::Unknown,
                exit_code: None,
                error: Some(format!("exit not observable: {e}")),
            };
        }
    };
    let exit_code = status.code();
    match intent {
        // Requested stop is a non-failure outcome whatever the exit code.
        Some(ControlOrder::Stop) => ExitClass {
            state: RunState::Stopped,
            exit_code,
            error: None,
        },
        // An interrupt is failure-classified regardless of the child's own
        // exit code.
        Some(ControlOrder::Interrupt) => ExitClass {
            state: RunState::Interrupted,
            exit_code,
            error: Some("execution interrupted".to_string()),
        },
        None => {
            if status.success() {
                ExitClass {
                    state: RunState::Completed,
                    exit_code,
                    error: None,
                }
            } else {
                let error = match exit_code {
                    Some(code) => format!("process exited with code {code}"),
                    None => "process terminated by signal".to_string(),
                };
                ExitClass {
                    state: RunState::Failed,
                    exit_code,
                    error: Some(error),
                }
            }
        }
    }
}

/// Persist the terminal snapshot (if enabled), then evict the instance
/// from the live registry.
///
/// A persistence failure is logged and returned to the caller that
/// launched the instance, but never blocks the eviction: the instance is
/// already terminally resolved in memory.
fn finalize(sup: &ProcessSupervisor, instance: &Arc<JobInstance>) -> Result<()> {
    let snapshot = instance.snapshot();
    let persisted = match &sup.history {
        Some(store) => store.record(&snapshot),
        None => Ok(()),
    };
    sup.registry.remove(instance.instance_id());
    if let Err(e) = &persisted {
        warn!(
            job = instance.job_id(),
            instance = instance.instance_id(),
            error = %e,
            "failed to persist terminal snapshot"
        );
    }
    persisted
}

fn spawn_child(def: &JobDefinition) -> std::io::Result<Child> {
    let mut cmd = Command::new(&def.command);
    cmd.args(&def.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.spawn()
}

fn spawn_output_reader<R>(
    instance: Arc<JobInstance>,
    stream: OutputStream,
    out: R,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(out);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(
                job = instance.job_id(),
                instance = instance.instance_id(),
                ?stream,
                "output: {line}"
            );
            instance.record_output(stream, line);
        }
    })
}

#[cfg(unix)]
fn signal_child(child: &mut Child, order: ControlOrder) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already exited; the pending wait will observe it.
        return;
    };
    let signal = match order {
        ControlOrder::Stop => Signal::SIGTERM,
        ControlOrder::Interrupt => Signal::SIGINT,
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        warn!(pid, ?signal, error = %e, "failed to signal child");
    }
}

#[cfg(not(unix))]
fn signal_child(child: &mut Child, _order: ControlOrder) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill child");
    }
}
