// src/ipc/server.rs

//! The IPC server side: one Unix stream socket per run process.
//!
//! Every connection gets its own task, so a request never blocks a
//! handler on another connection's completion, and the long-running push
//! mode of one subscriber never delays queries from other clients.
//! Malformed frames are dropped and logged; they never take the read loop
//! down.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{JobmonError, Result};
use crate::job::selector::InstanceSelector;
use crate::supervisor::ProcessSupervisor;

use super::frame::{Frame, read_frame, write_frame};
use super::protocol::{ErrorObject, InstanceTail, Request, Response, SOCKET_SUFFIX, ServerFrame};

/// Distinguishes sockets of one process when several runtimes share a
/// sockets directory (mostly under test).
static SOCKET_SEQ: AtomicU64 = AtomicU64::new(0);

/// A running IPC server; dropping the handle does not stop it, call
/// [`shutdown`](IpcServerHandle::shutdown).
pub struct IpcServerHandle {
    socket_path: PathBuf,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl IpcServerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting connections, close push loops and remove the socket
    /// file.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "ipc server task ended abnormally");
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), error = %e, "failed to remove socket file");
            }
        }
    }
}

/// Bind this process's API socket under `sockets_dir` and start serving.
pub async fn serve(sockets_dir: &Path, supervisor: ProcessSupervisor) -> Result<IpcServerHandle> {
    std::fs::create_dir_all(sockets_dir)?;
    let socket_path = sockets_dir.join(format!(
        "{}-{}.{SOCKET_SUFFIX}",
        std::process::id(),
        SOCKET_SEQ.fetch_add(1, Ordering::Relaxed),
    ));
    // A leftover file from a previous run with a recycled pid would block
    // the bind.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "ipc server listening");

    let token = CancellationToken::new();
    let accept_token = token.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = accept_token.cancelled() => {
                    debug!("ipc server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let supervisor = supervisor.clone();
                            let conn_token = accept_token.clone();
                            tokio::spawn(handle_connection(stream, supervisor, conn_token));
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept ipc connection");
                        }
                    }
                }
            }
        }
    });

    Ok(IpcServerHandle {
        socket_path,
        token,
        task,
    })
}

async fn handle_connection(
    stream: UnixStream,
    supervisor: ProcessSupervisor,
    token: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = read_frame::<_, Request>(&mut reader) => frame,
        };
        match frame {
            Ok(None) => break,
            Ok(Some(Frame::Malformed(error))) => {
                // Drop the message; subsequent well-formed frames on this
                // connection are unaffected.
                warn!(%error, "dropping malformed ipc request");
            }
            Ok(Some(Frame::Msg(Request::Subscribe { job }))) => {
                if write_frame(&mut writer, &ServerFrame::Response(Response::Subscribed))
                    .await
                    .is_err()
                {
                    break;
                }
                run_subscription(reader, writer, &supervisor, job, token).await;
                return;
            }
            Ok(Some(Frame::Msg(request))) => {
                let response = handle_request(&supervisor, request);
                if write_frame(&mut writer, &ServerFrame::Response(response))
                    .await
                    .is_err()
                {
                    debug!("client went away mid-response");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "closing ipc connection after unrecoverable protocol error");
                break;
            }
        }
    }
}

/// Handle one non-subscribe request. Quick by construction: only brief
/// registry/latch locks, never a wait on a child process.
fn handle_request(supervisor: &ProcessSupervisor, request: Request) -> Response {
    match request {
        Request::ListInstances { job } => Response::Instances {
            instances: supervisor.registry().snapshots(job.as_deref()),
        },
        Request::Tail { selector } => tail_instances(supervisor, &selector),
        Request::Stop { selector } => match stop_instance(supervisor, &selector) {
            Ok(instance_id) => Response::Stopped { instance_id },
            Err(e) => Response::Error {
                error: ErrorObject::from_error(&e),
            },
        },
        Request::Release { latch } => Response::Released {
            count: supervisor.latches().release(&latch),
        },
        Request::Subscribe { .. } => Response::Error {
            error: ErrorObject {
                kind: super::protocol::ErrorKind::Invalid,
                message: "subscribe is handled at the connection level".to_string(),
            },
        },
    }
}

fn tail_instances(supervisor: &ProcessSupervisor, selector: &InstanceSelector) -> Response {
    let matching = supervisor.registry().matching(selector);
    if matching.is_empty() {
        return Response::Error {
            error: ErrorObject::from_error(&JobmonError::NotFound(selector.to_string())),
        };
    }
    Response::Tail {
        tails: matching
            .into_iter()
            .map(|entry| InstanceTail {
                job_id: entry.instance.job_id().to_string(),
                instance_id: entry.instance.instance_id().to_string(),
                lines: entry.instance.tail(),
            })
            .collect(),
    }
}

/// Stop must target exactly one live instance; zero or several matches
/// are reported to the caller rather than guessed at.
fn stop_instance(supervisor: &ProcessSupervisor, selector: &InstanceSelector) -> Result<String> {
    let entry = supervisor.registry().resolve_one(selector)?;
    let instance_id = entry.instance.instance_id().to_string();
    supervisor.request_stop(&instance_id)?;
    Ok(instance_id)
}

/// Push mode: forward matching events until the client closes (or the
/// server shuts down).
async fn run_subscription(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    supervisor: &ProcessSupervisor,
    job_filter: Option<String>,
    token: CancellationToken,
) {
    let bus = supervisor.bus();
    let (listener_id, mut events) = bus.subscribe(job_filter);
    debug!("connection switched to push mode");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if write_frame(&mut writer, &ServerFrame::Event(event)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            // Detect the client closing its end; further requests on a
            // push-mode connection are ignored.
            closed = read_frame::<_, Request>(&mut reader) => {
                match closed {
                    Ok(None) | Err(_) => break,
                    Ok(Some(_)) => {}
                }
            }
        }
    }

    bus.unsubscribe(listener_id);
    debug!("push mode connection closed");
}
