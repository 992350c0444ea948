// src/supervisor/mod.rs

//! Process supervision: the live instance registry, the per-instance
//! supervision tasks, and the OS signal path.
//!
//! The supervisor owns every OS process backing a RUNNING instance.
//! Queries and control commands for other instances stay responsive while
//! one instance's child is still running: each instance has its own
//! supervision task, and the only long-blocking operation (wait-for-exit)
//! happens there.

pub mod process;
pub mod registry;
pub mod signals;

pub use process::{LaunchSpec, ProcessSupervisor, RunOptions};
pub use registry::{ControlOrder, LiveEntry, LiveRegistry};
pub use signals::spawn_signal_watcher;
