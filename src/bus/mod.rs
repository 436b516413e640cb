//! Progress Aggregator & Bus.
//!
//! Subscribers register and get an unsubscribe handle back; `publish`
//! invokes every subscriber in registration order, swallowing and logging
//! any individual delivery failure so one bad subscriber can't stall the
//! bus. Each subscriber owns a bounded queue; when the queue is full the
//! oldest *non-terminal* sample is dropped to make room rather than
//! blocking the publisher — terminal samples are never dropped.
//!
//! Grounded on the teacher's `downloader/events.rs` `EventBus`, replacing
//! its `tokio::sync::broadcast` (which drops under lag for every
//! subscriber alike, terminal or not) with the per-subscriber bounded queue
//! the spec's backpressure policy calls for.

use crate::model::ProgressUpdate;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    queue: Mutex<VecDeque<ProgressUpdate>>,
    capacity: usize,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

/// A subscriber's receiving half. Dropping it does not automatically
/// unsubscribe; call [`ProgressBus::unsubscribe`] explicitly (mirrors the
/// spec's "registration returns an unsubscribe handle" contract).
pub struct Subscription {
    bus: Arc<ProgressBusInner>,
    subscriber: Arc<Subscriber>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.subscriber.id
    }

    /// Waits for and returns the next queued update, or `None` once the bus
    /// has unsubscribed this subscriber.
    pub async fn recv(&self) -> Option<ProgressUpdate> {
        loop {
            {
                let mut q = self.subscriber.queue.lock().await;
                if let Some(update) = q.pop_front() {
                    return Some(update);
                }
            }
            if self.subscriber.closed.load(Ordering::Acquire) {
                return None;
            }
            self.subscriber.notify.notified().await;
        }
    }

    pub fn unsubscribe(self) {
        self.bus.unsubscribe(self.subscriber.id);
    }
}

struct ProgressBusInner {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl ProgressBusInner {
    fn unsubscribe(&self, id: u64) {
        // Synchronous best-effort removal; publish() also tolerates a
        // subscriber disappearing mid-iteration.
        if let Ok(mut subs) = self.subscribers.try_lock() {
            subs.retain(|s| s.id != id);
        }
    }
}

/// Fan-out bus feeding N subscribers (e.g. websocket clients) with merged
/// per-task and per-sub-task progress.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<ProgressBusInner>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProgressBusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub async fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_QUEUE_CAPACITY).await
    }

    pub async fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            id,
            queue: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        self.inner.subscribers.lock().await.push(subscriber.clone());
        Subscription {
            bus: self.inner.clone(),
            subscriber,
        }
    }

    pub async fn unsubscribe(&self, id: u64) {
        let mut subs = self.inner.subscribers.lock().await;
        if let Some(pos) = subs.iter().position(|s| s.id == id) {
            let removed = subs.remove(pos);
            removed.closed.store(true, Ordering::Release);
            removed.notify.notify_waiters();
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().await.len()
    }

    /// Delivers `update` to every subscriber, in registration order. Never
    /// blocks on a slow subscriber: a full queue drops its oldest
    /// non-terminal entry before enqueuing; if every queued entry is
    /// terminal (so none is droppable) the new update is logged and
    /// dropped instead of blocking the publisher.
    pub async fn publish(&self, update: ProgressUpdate) {
        let subs = self.inner.subscribers.lock().await.clone();
        for sub in subs {
            let mut q = sub.queue.lock().await;
            if q.len() >= sub.capacity {
                if let Some(pos) = q.iter().position(|u| !u.is_always_delivered()) {
                    q.remove(pos);
                } else {
                    warn!(subscriber_id = sub.id, "progress bus queue full of terminal updates, dropping new sample");
                    continue;
                }
            }
            q.push_back(update.clone());
            drop(q);
            sub.notify.notify_one();
        }
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a producer should emit `candidate` given the `previous` sample it
/// last published for the same (task, sub-task) pair. Status transitions and
/// terminal updates are always delivered regardless of timing/delta.
pub fn should_emit(previous: Option<&ProgressUpdate>, candidate: &ProgressUpdate) -> bool {
    if candidate.is_always_delivered() {
        return true;
    }
    let Some(previous) = previous else { return true };
    if previous.status != candidate.status {
        return true;
    }
    let elapsed_ms = (candidate.timestamp - previous.timestamp).num_milliseconds();
    if elapsed_ms >= 500 {
        return true;
    }
    match (previous.progress, candidate.progress) {
        (Some(p), Some(c)) => (c - p).abs() >= 0.1,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::Status;

    fn sample(status: Status, progress: f64) -> ProgressUpdate {
        ProgressUpdate::new("task-1", status).with_progress(progress)
    }

    #[tokio::test]
    async fn publish_is_delivered_in_order() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe().await;
        bus.publish(sample(Status::Downloading, 10.0)).await;
        bus.publish(sample(Status::Downloading, 20.0)).await;

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.progress, Some(10.0));
        assert_eq!(second.progress, Some(20.0));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe().await;
        let id = sub.id();
        bus.unsubscribe(id).await;
        assert_eq!(bus.subscriber_count().await, 0);
        bus.publish(sample(Status::Downloading, 10.0)).await;
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_non_terminal() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe_with_capacity(2).await;
        bus.publish(sample(Status::Downloading, 10.0)).await;
        bus.publish(sample(Status::Downloading, 20.0)).await;
        bus.publish(sample(Status::Downloading, 30.0)).await;

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert_eq!(first.progress, Some(20.0));
        assert_eq!(second.progress, Some(30.0));
    }

    #[test]
    fn should_emit_always_delivers_terminal_and_transitions() {
        let prev = sample(Status::Downloading, 50.0);
        let terminal = sample(Status::Completed, 100.0);
        assert!(should_emit(Some(&prev), &terminal));

        let transition = sample(Status::Merging, 50.0);
        assert!(should_emit(Some(&prev), &transition));
    }

    #[test]
    fn should_emit_suppresses_tiny_same_status_deltas() {
        let mut prev = sample(Status::Downloading, 50.0);
        prev.timestamp = chrono::Utc::now();
        let mut candidate = sample(Status::Downloading, 50.05);
        candidate.timestamp = prev.timestamp;
        assert!(!should_emit(Some(&prev), &candidate));
    }
}
