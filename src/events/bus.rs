// src/events/bus.rs

//! Listener registry and fan-out.
//!
//! Each listener gets its own unbounded channel, so delivery to one
//! listener can never block or lose events for another; per-listener
//! order always matches publish order. Listeners whose receiving side has
//! gone away are pruned on the next publish.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use super::JobEvent;

/// Handle identifying one subscription, returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    /// Only events for this job are delivered when set.
    job_filter: Option<String>,
    tx: mpsc::UnboundedSender<JobEvent>,
}

/// In-process registry of event listeners.
///
/// Plugin-layer listeners use the same [`subscribe`](EventBus::subscribe)
/// API as built-in ones and therefore observe the identical event stream.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, optionally filtered by job id.
    ///
    /// Events published after this call are delivered in publish order.
    pub fn subscribe(
        &self,
        job_filter: Option<String>,
    ) -> (ListenerId, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, Listener { job_filter, tx });
        (ListenerId(id), rx)
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.lock().remove(&id.0);
    }

    /// Deliver an event to every currently matching listener.
    ///
    /// Enqueueing is non-blocking; a listener with a dropped receiver is
    /// removed and does not affect delivery to the rest.
    pub fn publish(&self, event: &JobEvent) {
        let mut listeners = self.lock();
        let mut dead = Vec::new();
        for (id, listener) in listeners.iter() {
            if let Some(job_id) = &listener.job_filter {
                if job_id != event.job_id() {
                    continue;
                }
            }
            if listener.tx.send(event.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!(listener = id, "pruning closed event listener");
            listeners.remove(&id);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Listener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::events::OutputStream;

    fn output_event(job_id: &str) -> JobEvent {
        JobEvent::Output {
            job_id: job_id.to_string(),
            instance_id: "i1".to_string(),
            stream: OutputStream::Stdout,
            chunk: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(None);

        for n in 0..5 {
            bus.publish(&JobEvent::Output {
                job_id: "j".to_string(),
                instance_id: "i".to_string(),
                stream: OutputStream::Stdout,
                chunk: n.to_string(),
            });
        }

        for n in 0..5 {
            match rx.recv().await {
                Some(JobEvent::Output { chunk, .. }) => assert_eq!(chunk, n.to_string()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn filters_by_job_id() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe(Some("wanted".to_string()));

        bus.publish(&output_event("other"));
        bus.publish(&output_event("wanted"));

        let ev = rx.recv().await.expect("one event");
        assert_eq!(ev.job_id(), "wanted");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_listener_does_not_affect_others() {
        let bus = Arc::new(EventBus::new());
        let (_dead, dead_rx) = bus.subscribe(None);
        drop(dead_rx);
        let (_live, mut rx) = bus.subscribe(None);

        bus.publish(&output_event("j"));

        assert_eq!(rx.recv().await.expect("delivered").job_id(), "j");
        assert_eq!(bus.listener_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe(None);
        bus.unsubscribe(id);
        bus.publish(&output_event("j"));
        assert!(rx.recv().await.is_none());
    }
}
