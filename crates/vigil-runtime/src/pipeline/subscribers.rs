//! Per-task live subscriber channels.
//!
//! Each registered task owns a bounded replay buffer plus a broadcast
//! channel. A slow or absent viewer never stalls execution: the buffer
//! drops its oldest entry once full (counted, silent), and the broadcast
//! channel drops lagging receivers rather than blocking the sender.
//!
//! Lifecycle: `register` on submit, `remove` on terminal cleanup. Publish
//! and subscribe serialize on the buffer lock, so a subscriber's snapshot
//! plus its receiver together see every event exactly once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use vigil_core::events::AuditEvent;

/// A live subscription: buffered history plus a receiver for new events.
pub struct LiveSubscription {
    /// Already-buffered events, oldest first.
    pub snapshot: Vec<AuditEvent>,
    /// Receiver for events published after the snapshot was taken.
    pub receiver: broadcast::Receiver<AuditEvent>,
}

struct TaskChannel {
    buffer: Mutex<VecDeque<AuditEvent>>,
    tx: broadcast::Sender<AuditEvent>,
    last_sequence: AtomicI64,
    dropped: AtomicU64,
}

/// Process-wide registry of per-task live channels.
pub struct SubscriberRegistry {
    channels: DashMap<String, Arc<TaskChannel>>,
    buffer_capacity: usize,
    channel_capacity: usize,
}

impl SubscriberRegistry {
    /// Create a registry with the given per-task capacities.
    pub fn new(buffer_capacity: usize, channel_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            buffer_capacity,
            channel_capacity,
        }
    }

    /// Register a task channel. Idempotent.
    pub fn register(&self, task_id: &str) {
        let _ = self.channels.entry(task_id.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel(self.channel_capacity);
            Arc::new(TaskChannel {
                buffer: Mutex::new(VecDeque::with_capacity(self.buffer_capacity)),
                tx,
                last_sequence: AtomicI64::new(0),
                dropped: AtomicU64::new(0),
            })
        });
    }

    /// Remove a task channel on terminal cleanup. Existing receivers see
    /// the channel close after draining already-sent events.
    pub fn remove(&self, task_id: &str) {
        if self.channels.remove(task_id).is_some() {
            debug!(task_id, "subscriber channel released");
        }
    }

    /// Publish an event to the task's channel.
    ///
    /// Persisted kinds enter the replay buffer (drop-oldest once full);
    /// ephemeral kinds go to live receivers only. Returns the number of
    /// live receivers that got the event.
    pub fn publish(&self, event: &AuditEvent) -> usize {
        let Some(channel) = self
            .channels
            .get(event.task_id.as_str())
            .map(|c| Arc::clone(c.value()))
        else {
            return 0;
        };

        let mut buffer = channel.buffer.lock();
        if !event.kind.is_ephemeral() {
            if buffer.len() >= self.buffer_capacity {
                let _ = buffer.pop_front();
                let _ = channel.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("event_buffer_drops_total").increment(1);
            }
            buffer.push_back(event.clone());
            channel
                .last_sequence
                .store(event.sequence, Ordering::Release);
        }
        // Send while holding the buffer lock so a concurrent subscriber's
        // snapshot + receiver never miss or double-count this event.
        let receivers = channel.tx.send(event.clone()).unwrap_or(0);
        drop(buffer);
        receivers
    }

    /// Open a live subscription: buffered history + new-event receiver.
    ///
    /// Returns `None` when the task has no live channel (already finished
    /// and cleaned up) — callers fall back to polling durable storage.
    pub fn subscribe(&self, task_id: &str) -> Option<LiveSubscription> {
        let channel = self.channels.get(task_id).map(|c| Arc::clone(c.value()))?;
        let buffer = channel.buffer.lock();
        let snapshot = buffer.iter().cloned().collect();
        let receiver = channel.tx.subscribe();
        drop(buffer);
        Some(LiveSubscription { snapshot, receiver })
    }

    /// Sequence of the most recent persisted event seen by the channel.
    pub fn last_sequence(&self, task_id: &str) -> i64 {
        self.channels
            .get(task_id)
            .map_or(0, |c| c.last_sequence.load(Ordering::Acquire))
    }

    /// Total buffer drops for a task (slow/absent viewer indicator).
    pub fn dropped(&self, task_id: &str) -> u64 {
        self.channels
            .get(task_id)
            .map_or(0, |c| c.dropped.load(Ordering::Relaxed))
    }

    /// Whether a live channel exists for the task.
    pub fn has_channel(&self, task_id: &str) -> bool {
        self.channels.contains_key(task_id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
