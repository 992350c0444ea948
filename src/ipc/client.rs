// src/ipc/client.rs

//! The IPC client side, used by external tooling.
//!
//! There is no central daemon: every run process serves its own socket
//! under the shared sockets directory. The client enumerates the live
//! sockets, sends the request to each and merges the answers. Sockets
//! whose server has gone away are skipped (and their stale files cleaned
//! up) with a warning; a dead server never fails the whole query.

use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{JobmonError, Result};
use crate::events::JobEvent;
use crate::job::instance::InstanceSnapshot;
use crate::job::selector::InstanceSelector;

use super::frame::{Frame, read_frame, write_frame};
use super::protocol::{
    ErrorKind, InstanceTail, Request, Response, SOCKET_SUFFIX, ServerFrame,
};

/// Response of one server, tagged with its socket path.
#[derive(Debug)]
pub struct ServerReply {
    pub server: PathBuf,
    pub response: Response,
}

/// Pure protocol client; holds no in-process runtime state.
pub struct IpcClient {
    sockets_dir: PathBuf,
}

impl IpcClient {
    pub fn new(sockets_dir: impl Into<PathBuf>) -> Self {
        Self {
            sockets_dir: sockets_dir.into(),
        }
    }

    /// Send a request to every live server and collect the replies.
    pub async fn broadcast(&self, request: &Request) -> Result<Vec<ServerReply>> {
        let mut replies = Vec::new();
        for socket in self.socket_files()? {
            match self.request_one(&socket, request).await {
                Ok(response) => replies.push(ServerReply {
                    server: socket,
                    response,
                }),
                Err(e) => self.discard_dead_socket(&socket, &e),
            }
        }
        Ok(replies)
    }

    /// Merged snapshot list of all live instances.
    ///
    /// No live servers (or an unknown job filter) yields an empty list,
    /// not an error.
    pub async fn list_instances(&self, job: Option<&str>) -> Result<Vec<InstanceSnapshot>> {
        let request = Request::ListInstances {
            job: job.map(str::to_string),
        };
        let mut instances = Vec::new();
        for reply in self.broadcast(&request).await? {
            match reply.response {
                Response::Instances {
                    instances: mut found,
                } => instances.append(&mut found),
                other => warn!(server = %reply.server.display(), ?other, "unexpected reply to list-instances"),
            }
        }
        Ok(instances)
    }

    /// Merged buffered output of every instance the selector matches.
    pub async fn tail(&self, selector: &InstanceSelector) -> Result<Vec<InstanceTail>> {
        let request = Request::Tail {
            selector: selector.clone(),
        };
        let mut tails = Vec::new();
        let mut servers = 0;
        for reply in self.broadcast(&request).await? {
            servers += 1;
            match reply.response {
                Response::Tail { tails: mut found } => tails.append(&mut found),
                // A server without a match reports not-found; other
                // servers may still hold matching instances.
                Response::Error { error } if error.kind == ErrorKind::NotFound => {}
                other => warn!(server = %reply.server.display(), ?other, "unexpected reply to tail"),
            }
        }
        if servers > 0 && tails.is_empty() {
            return Err(JobmonError::NotFound(selector.to_string()));
        }
        Ok(tails)
    }

    /// Stop the instances the selector resolves to, one per server.
    ///
    /// Returns the stopped instance ids. Fails with `NotFound` when no
    /// server holds a match, or `Ambiguous` when any server reports the
    /// selector ambiguous.
    pub async fn stop(&self, selector: &InstanceSelector) -> Result<Vec<String>> {
        let request = Request::Stop {
            selector: selector.clone(),
        };
        let mut stopped = Vec::new();
        let mut ambiguous: Option<usize> = None;
        for reply in self.broadcast(&request).await? {
            match reply.response {
                Response::Stopped { instance_id } => stopped.push(instance_id),
                Response::Error { error } => match error.kind {
                    ErrorKind::NotFound => {}
                    ErrorKind::Ambiguous => ambiguous = Some(ambiguous.unwrap_or(0) + 1),
                    ErrorKind::Invalid => {
                        warn!(server = %reply.server.display(), message = %error.message, "stop rejected")
                    }
                },
                other => warn!(server = %reply.server.display(), ?other, "unexpected reply to stop"),
            }
        }
        if let Some(count) = ambiguous {
            return Err(JobmonError::Ambiguous {
                selector: selector.to_string(),
                count,
            });
        }
        if stopped.is_empty() {
            return Err(JobmonError::NotFound(selector.to_string()));
        }
        Ok(stopped)
    }

    /// Release a latch token on every server; returns the total number of
    /// released instances (zero for an unknown token).
    pub async fn release(&self, latch: &str) -> Result<usize> {
        let request = Request::Release {
            latch: latch.to_string(),
        };
        let mut count = 0;
        for reply in self.broadcast(&request).await? {
            match reply.response {
                Response::Released { count: released } => count += released,
                other => warn!(server = %reply.server.display(), ?other, "unexpected reply to release"),
            }
        }
        Ok(count)
    }

    /// Subscribe to events from every live server, merged into one
    /// stream. The stream ends when all servers have closed.
    pub async fn subscribe(&self, job: Option<&str>) -> Result<mpsc::Receiver<JobEvent>> {
        let request = Request::Subscribe {
            job: job.map(str::to_string),
        };
        let (tx, rx) = mpsc::channel(256);
        for socket in self.socket_files()? {
            let stream = match UnixStream::connect(&socket).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.discard_dead_socket(&socket, &JobmonError::IoError(e));
                    continue;
                }
            };
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            if let Err(e) = write_frame(&mut writer, &request).await {
                self.discard_dead_socket(&socket, &e);
                continue;
            }
            // First frame must acknowledge the subscription.
            match read_frame::<_, ServerFrame>(&mut reader).await {
                Ok(Some(Frame::Msg(ServerFrame::Response(Response::Subscribed)))) => {}
                other => {
                    warn!(server = %socket.display(), ?other, "subscription not acknowledged");
                    continue;
                }
            }
            let tx = tx.clone();
            let server = socket.clone();
            tokio::spawn(async move {
                // Keep the write half open; the server detects our close.
                let _writer = writer;
                loop {
                    match read_frame::<_, ServerFrame>(&mut reader).await {
                        Ok(Some(Frame::Msg(ServerFrame::Event(event)))) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(Frame::Msg(other))) => {
                            debug!(server = %server.display(), ?other, "ignoring non-event frame in push mode");
                        }
                        Ok(Some(Frame::Malformed(error))) => {
                            warn!(server = %server.display(), %error, "dropping malformed event frame");
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            });
        }
        Ok(rx)
    }

    async fn request_one(&self, socket: &Path, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(socket).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        write_frame(&mut writer, request).await?;
        match read_frame::<_, ServerFrame>(&mut reader).await? {
            Some(Frame::Msg(ServerFrame::Response(response))) => Ok(response),
            Some(Frame::Msg(ServerFrame::Event(_))) => Err(JobmonError::ProtocolDecode(
                "unexpected event frame outside push mode".to_string(),
            )),
            Some(Frame::Malformed(error)) => Err(JobmonError::ProtocolDecode(error)),
            None => Err(JobmonError::ProtocolDecode(
                "server closed before responding".to_string(),
            )),
        }
    }

    /// Live socket files under the sockets directory. A missing directory
    /// simply means no live servers.
    fn socket_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.sockets_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut sockets: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext == SOCKET_SUFFIX)
            })
            .collect();
        sockets.sort();
        Ok(sockets)
    }

    /// A server that refuses connections has exited without removing its
    /// socket; clean the file up so later queries skip it silently. Other
    /// errors only produce a warning.
    fn discard_dead_socket(&self, socket: &Path, error: &JobmonError) {
        warn!(socket = %socket.display(), %error, "skipping unreachable server socket");
        let refused = matches!(
            error,
            JobmonError::IoError(io) if io.kind() == std::io::ErrorKind::ConnectionRefused
        );
        if !refused {
            return;
        }
        if let Err(e) = std::fs::remove_file(socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(socket = %socket.display(), error = %e, "failed to remove stale socket file");
            }
        }
    }
}
