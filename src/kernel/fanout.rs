//! Event Fan-out: a per-job multicast registry, and `activeCancels`, the
//! per-job cancellation handle map the Scheduler consults on `Cancel(id)`.
//!
//! Both maps are guarded by a single reader-writer lock (`tokio::sync::RwLock`)
//! as required by the concurrency model: `notify` holds the reader lock for
//! its *entire* iteration so a concurrent `notify_and_close` cannot remove and
//! close a sink between lookup and send. `notify_and_close` removes the
//! registry entry and closes former sinks inside one writer-lock critical
//! section, so no `notify` call started after the removal can observe those
//! sinks again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::jobs::JobEvent;

/// Bounded capacity of a single subscriber's sink. A slow consumer drops
/// events for itself only; other subscribers are unaffected.
const SINK_CAPACITY: usize = 64;

struct Inner {
    subscribers: HashMap<Uuid, HashMap<u64, mpsc::Sender<JobEvent>>>,
    active_cancels: HashMap<Uuid, CancellationToken>,
}

/// A live subscription to a job's events. Drop or call
/// [`Registry::unsubscribe`] to stop receiving and free the registry slot.
pub struct Subscription {
    pub job_id: Uuid,
    sub_id: u64,
    pub receiver: mpsc::Receiver<JobEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.receiver.recv().await
    }
}

/// The shared registry backing both the Event Fan-out (D) and the
/// Scheduler's per-job cancellation map.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
    next_sub_id: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                subscribers: HashMap::new(),
                active_cancels: HashMap::new(),
            })),
            next_sub_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to a job's events. Multiple subscriptions per id are
    /// supported; each gets an independent bounded sink.
    pub async fn subscribe(&self, job_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write().await;
        inner
            .subscribers
            .entry(job_id)
            .or_default()
            .insert(sub_id, tx);

        Subscription {
            job_id,
            sub_id,
            receiver: rx,
        }
    }

    /// Remove a subscription. If it was the last one for `job_id`, the id's
    /// entry is removed from the registry entirely.
    pub async fn unsubscribe(&self, sub: &Subscription) {
        let mut inner = self.inner.write().await;
        if let Some(sinks) = inner.subscribers.get_mut(&sub.job_id) {
            sinks.remove(&sub.sub_id);
            if sinks.is_empty() {
                inner.subscribers.remove(&sub.job_id);
            }
        }
    }

    /// Non-blocking send to every current subscriber of `job_id`. A full
    /// sink drops the event for that subscriber only.
    pub async fn notify(&self, job_id: Uuid, event: JobEvent) {
        let inner = self.inner.read().await;
        if let Some(sinks) = inner.subscribers.get(&job_id) {
            for tx in sinks.values() {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    /// Atomically remove `job_id`'s entry, then best-effort deliver `event`
    /// to each former sink before dropping the sender (which closes the
    /// channel; readers observe end-of-stream once they drain it).
    pub async fn notify_and_close(&self, job_id: Uuid, event: JobEvent) {
        let sinks = {
            let mut inner = self.inner.write().await;
            inner.subscribers.remove(&job_id)
        };

        if let Some(sinks) = sinks {
            for tx in sinks.into_values() {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    /// Register the cancellation handle for a job actively being processed.
    pub async fn register_cancel(&self, job_id: Uuid, token: CancellationToken) {
        let mut inner = self.inner.write().await;
        inner.active_cancels.insert(job_id, token);
    }

    pub async fn remove_cancel(&self, job_id: Uuid) {
        let mut inner = self.inner.write().await;
        inner.active_cancels.remove(&job_id);
    }

    /// Cancel an in-flight job. Returns whether a handle was found — callers
    /// must not treat `false` as an error; the job may not yet be dequeued or
    /// may already be terminal.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let inner = self.inner.read().await;
        if let Some(token) = inner.active_cancels.get(&job_id) {
            token.cancel();
            true
        } else {
            false
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
