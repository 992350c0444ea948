// src/ipc/mod.rs

//! Local inter-process communication.
//!
//! Independent client processes query and control running instances over
//! Unix stream sockets, one per run process, collected under a shared
//! sockets directory. Both roles speak the same length-delimited JSON
//! protocol defined in [`protocol`]; [`frame`] owns the framing so a
//! truncated or malformed message can never crash a reading loop.
//!
//! Local-only by design: there is no network transport and no
//! authentication.

pub mod client;
pub mod frame;
pub mod protocol;
pub mod server;

pub use client::{IpcClient, ServerReply};
pub use protocol::{ErrorKind, ErrorObject, InstanceTail, Request, Response, ServerFrame};
pub use server::{IpcServerHandle, serve};
