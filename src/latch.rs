// src/latch.rs

//! Pending/release coordination.
//!
//! An instance created with a latch token parks in PENDING until the
//! token is released. Multiple instances may share one token; a release
//! consumes the token in full: every waiter is released and the mapping
//! entry is cleared. Releasing an unknown or already-consumed token is a
//! no-op reporting zero released instances, not an error.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, info};

struct Waiter {
    instance_id: String,
    tx: oneshot::Sender<()>,
}

/// Mapping from latch token to the instances currently PENDING on it.
#[derive(Default)]
pub struct LatchCoordinator {
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl LatchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance as waiting on `token`.
    ///
    /// The returned receiver resolves when the token is released; the
    /// waiting supervision task performs the PENDING -> RUNNING transition
    /// and process start itself.
    pub fn register(&self, token: &str, instance_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock()
            .entry(token.to_string())
            .or_default()
            .push(Waiter {
                instance_id: instance_id.to_string(),
                tx,
            });
        debug!(latch = token, instance = instance_id, "instance parked on latch");
        rx
    }

    /// Release every instance waiting on `token` and clear the entry.
    ///
    /// Returns the number of instances actually released. Waiters whose
    /// supervision task already went away (stopped while PENDING) are
    /// skipped and not counted.
    pub fn release(&self, token: &str) -> usize {
        let waiters = match self.lock().remove(token) {
            Some(waiters) => waiters,
            None => {
                debug!(latch = token, "release of unknown latch is a no-op");
                return 0;
            }
        };
        let mut released = 0;
        for waiter in waiters {
            if waiter.tx.send(()).is_ok() {
                released += 1;
            } else {
                debug!(
                    latch = token,
                    instance = %waiter.instance_id,
                    "skipping waiter that is no longer pending"
                );
            }
        }
        info!(latch = token, released, "latch released");
        released
    }

    /// Drop a single waiter, used when a PENDING instance is terminated
    /// before its latch fires. Empty entries are removed so a later
    /// release reports zero.
    pub fn forget(&self, token: &str, instance_id: &str) {
        let mut waiters = self.lock();
        if let Some(entry) = waiters.get_mut(token) {
            entry.retain(|w| w.instance_id != instance_id);
            if entry.is_empty() {
                waiters.remove(token);
            }
        }
    }

    /// Tokens currently holding at least one waiter.
    pub fn pending_tokens(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Number of instances currently waiting on `token`.
    pub fn waiting_on(&self, token: &str) -> usize {
        self.lock().get(token).map_or(0, Vec::len)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Waiter>>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn release_fires_all_waiters_and_consumes_token() {
        let latches = LatchCoordinator::new();
        let rx1 = latches.register("l1", "i1");
        let rx2 = latches.register("l1", "i2");
        let rx_other = latches.register("l2", "i3");

        assert_eq!(latches.release("l1"), 2);
        rx1.await.expect("waiter 1 released");
        rx2.await.expect("waiter 2 released");

        // Second release of the same token is a no-op.
        assert_eq!(latches.release("l1"), 0);
        // Unrelated token is untouched.
        assert_eq!(latches.pending_tokens(), vec!["l2".to_string()]);
        drop(rx_other);
    }

    #[tokio::test]
    async fn unknown_token_releases_zero() {
        let latches = LatchCoordinator::new();
        assert_eq!(latches.release("never-registered"), 0);
    }

    #[tokio::test]
    async fn dropped_waiters_are_not_counted() {
        let latches = LatchCoordinator::new();
        let rx = latches.register("l1", "i1");
        drop(rx);
        assert_eq!(latches.release("l1"), 0);
    }

    #[tokio::test]
    async fn forget_removes_single_waiter() {
        let latches = LatchCoordinator::new();
        let _rx1 = latches.register("l1", "i1");
        let rx2 = latches.register("l1", "i2");
        latches.forget("l1", "i1");
        assert_eq!(latches.release("l1"), 1);
        rx2.await.expect("remaining waiter released");
        assert!(latches.pending_tokens().is_empty());
    }
}
