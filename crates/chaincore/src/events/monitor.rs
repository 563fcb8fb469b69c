// crates/chaincore/src/events/monitor.rs

//! In-process execution monitor.
//!
//! Every subscriber owns a bounded queue. When a queue is full the oldest
//! event is discarded to make room for the new one, so a slow subscriber
//! only ever loses its own backlog and `publish` never waits. The number of
//! discarded events is reported by [`Subscription::dropped`].

use crate::ExecutionEvent;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Default per-subscriber queue length
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Snapshot of the progress of the most recently started execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub execution_id: Option<String>,
    pub percent_complete: f64,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub skipped_nodes: usize,
    pub total_nodes: usize,
    pub current_node: Option<String>,
    pub running_nodes: Vec<String>,
}

#[derive(Default)]
struct ProgressState {
    execution_id: Option<String>,
    total: usize,
    completed: usize,
    failed: usize,
    skipped: usize,
    running: Vec<String>,
}

impl ProgressState {
    fn apply(&mut self, event: &ExecutionEvent) {
        if let ExecutionEvent::ExecutionStarted {
            execution_id,
            total_nodes,
            ..
        } = event
        {
            *self = ProgressState {
                execution_id: Some(execution_id.clone()),
                total: *total_nodes,
                ..ProgressState::default()
            };
            return;
        }

        if self.execution_id.as_deref() != Some(event.execution_id()) {
            return;
        }

        match event {
            ExecutionEvent::NodeStarted { node_id, .. } => {
                if !self.running.contains(node_id) {
                    self.running.push(node_id.clone());
                }
            }
            ExecutionEvent::NodeCompleted { node_id, .. } => {
                self.completed += 1;
                self.running.retain(|n| n != node_id);
            }
            ExecutionEvent::NodeFailed { node_id, .. } => {
                self.failed += 1;
                self.running.retain(|n| n != node_id);
            }
            ExecutionEvent::NodeSkipped { node_id, .. } => {
                self.skipped += 1;
                self.running.retain(|n| n != node_id);
            }
            ExecutionEvent::ExecutionCompleted { .. } => self.running.clear(),
            _ => {}
        }
    }

    fn snapshot(&self) -> ExecutionProgress {
        let finished = self.completed + self.failed + self.skipped;
        let percent_complete = if self.total == 0 {
            0.0
        } else {
            (finished as f64 / self.total as f64 * 100.0).min(100.0)
        };
        ExecutionProgress {
            execution_id: self.execution_id.clone(),
            percent_complete,
            completed_nodes: self.completed,
            failed_nodes: self.failed,
            skipped_nodes: self.skipped,
            total_nodes: self.total,
            current_node: self.running.last().cloned(),
            running_nodes: self.running.clone(),
        }
    }
}

struct SubscriberQueue {
    id: u64,
    capacity: usize,
    events: Mutex<VecDeque<ExecutionEvent>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn push(&self, event: ExecutionEvent) {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Receiving end of a monitor subscription
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Wait for the next event. Returns `None` once the subscription is
    /// closed and its backlog drained.
    pub async fn recv(&self) -> Option<ExecutionEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<ExecutionEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<ExecutionEvent> {
        self.queue.events.lock().drain(..).collect()
    }

    /// Events discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Detached queues are skipped by publish and pruned on the next
        // subscribe/unsubscribe.
        self.queue.close();
    }
}

/// Non-blocking publish/subscribe hub for execution events
pub struct ExecutionMonitor {
    buffer: usize,
    subscribers: ArcSwap<Vec<Arc<SubscriberQueue>>>,
    registry: Mutex<()>,
    next_id: AtomicU64,
    progress: Mutex<ProgressState>,
    closed: AtomicBool,
}

impl ExecutionMonitor {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: ArcSwap::from_pointee(Vec::new()),
            registry: Mutex::new(()),
            next_id: AtomicU64::new(1),
            progress: Mutex::new(ProgressState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            capacity: self.buffer,
            events: Mutex::new(VecDeque::with_capacity(self.buffer.min(64))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });

        if self.closed.load(Ordering::Acquire) {
            queue.close();
            return Subscription { queue };
        }

        let _guard = self.registry.lock();
        let mut next: Vec<Arc<SubscriberQueue>> = self
            .subscribers
            .load()
            .iter()
            .filter(|q| !q.is_closed())
            .cloned()
            .collect();
        next.push(queue.clone());
        self.subscribers.store(Arc::new(next));
        tracing::debug!("Monitor subscriber {} attached", queue.id);

        Subscription { queue }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        let id = subscription.id();
        subscription.queue.close();

        let _guard = self.registry.lock();
        let next: Vec<Arc<SubscriberQueue>> = self
            .subscribers
            .load()
            .iter()
            .filter(|q| q.id != id && !q.is_closed())
            .cloned()
            .collect();
        self.subscribers.store(Arc::new(next));
        tracing::debug!("Monitor subscriber {} detached", id);
    }

    /// Deliver an event to every live subscriber. Never blocks on a slow
    /// subscriber.
    pub fn publish(&self, event: ExecutionEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.progress.lock().apply(&event);

        let subscribers = self.subscribers.load();
        for queue in subscribers.iter().filter(|q| !q.is_closed()) {
            queue.push(event.clone());
        }
    }

    pub fn progress(&self) -> ExecutionProgress {
        self.progress.lock().snapshot()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .load()
            .iter()
            .filter(|q| !q.is_closed())
            .count()
    }

    /// Close every subscription. Later publishes are discarded. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.registry.lock();
        for queue in self.subscribers.load().iter() {
            queue.close();
        }
        self.subscribers.store(Arc::new(Vec::new()));
    }
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}
