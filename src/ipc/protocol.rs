// src/ipc/protocol.rs

//! Wire messages exchanged between a run process and client tooling.
//!
//! Requests carry a verb plus a target selector; responses carry either
//! an instance-snapshot list, a tail payload, an acknowledgement, or a
//! structured error object. After a `subscribe` request the server keeps
//! pushing event frames until the client closes the connection.

use serde::{Deserialize, Serialize};

use crate::errors::JobmonError;
use crate::events::JobEvent;
use crate::job::instance::{InstanceSnapshot, TailLine};
use crate::job::selector::InstanceSelector;

/// File extension of server sockets under the sockets directory.
pub const SOCKET_SUFFIX: &str = "sock";

/// A client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "kebab-case")]
pub enum Request {
    /// Snapshot list of live instances, optionally filtered by job id.
    ListInstances {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job: Option<String>,
    },
    /// Buffered output of the matching instances.
    Tail { selector: InstanceSelector },
    /// Stop exactly one live instance.
    Stop { selector: InstanceSelector },
    /// Release every instance pending on a latch token.
    Release { latch: String },
    /// Switch this connection to push mode.
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job: Option<String>,
    },
}

/// A server response to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Response {
    Instances { instances: Vec<InstanceSnapshot> },
    Tail { tails: Vec<InstanceTail> },
    Stopped { instance_id: String },
    Released { count: usize },
    Subscribed,
    Error { error: ErrorObject },
}

/// Buffered output of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTail {
    pub job_id: String,
    pub instance_id: String,
    pub lines: Vec<TailLine>,
}

/// Structured error returned instead of throwing across the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    Ambiguous,
    Invalid,
}

impl ErrorObject {
    pub fn from_error(err: &JobmonError) -> Self {
        let kind = match err {
            JobmonError::NotFound(_) => ErrorKind::NotFound,
            JobmonError::Ambiguous { .. } => ErrorKind::Ambiguous,
            _ => ErrorKind::Invalid,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Everything a server may write on a connection: direct responses and,
/// in push mode, event frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Response(Response),
    Event(JobEvent),
}
