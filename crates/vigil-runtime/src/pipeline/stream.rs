//! Live event subscription with a durable-storage fallback.
//!
//! The live path drains the replay buffer first (no missed recent
//! activity), then streams new events deduplicated by sequence, closing
//! after the terminal event. A lagged receiver is refilled from durable
//! storage — persisted events can never be lost to backpressure, only
//! ephemeral fragments.
//!
//! When no live channel exists (the task already finished), the
//! subscription polls durable storage from the requested offset at a
//! coarser interval, emitting heartbeats and ending on the terminal event
//! or after an idle timeout.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use vigil_core::events::AuditEvent;
use vigil_settings::StreamSettings;
use vigil_store::AuditStore;

use super::subscribers::{LiveSubscription, SubscriberRegistry};

/// Page size for durable-storage reads.
const REPLAY_PAGE: i64 = 256;

/// One item of a subscription stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    /// An audit event, live or replayed.
    Event(AuditEvent),
    /// Keep-alive marker on the polling fallback path.
    Heartbeat,
}

/// Subscribe to a task's events starting after `after_sequence`.
///
/// The stream ends after yielding the terminal event, or (fallback path
/// only) after the idle timeout. Dropping the stream detaches the caller
/// with no side effects on the task.
pub fn subscribe(
    store: Arc<AuditStore>,
    subscribers: Arc<SubscriberRegistry>,
    task_id: String,
    after_sequence: i64,
    settings: StreamSettings,
) -> impl Stream<Item = StreamItem> + Send {
    stream! {
        let mut last_sequence = after_sequence;

        if let Some(LiveSubscription { snapshot, mut receiver }) = subscribers.subscribe(&task_id) {
            debug!(task_id, after_sequence, buffered = snapshot.len(), "live subscription");

            // 1. Drain buffered history in order.
            for event in snapshot {
                if event.sequence <= last_sequence {
                    continue;
                }
                last_sequence = event.sequence;
                let terminal = event.kind.is_terminal();
                yield StreamItem::Event(event);
                if terminal {
                    return;
                }
            }

            // 2. Stream new events, deduplicating against the drained history.
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if event.kind.is_ephemeral() {
                            yield StreamItem::Event(event);
                            continue;
                        }
                        if event.sequence <= last_sequence {
                            continue;
                        }
                        last_sequence = event.sequence;
                        let terminal = event.kind.is_terminal();
                        yield StreamItem::Event(event);
                        if terminal {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Persisted events are never lost: refill from storage.
                        warn!(task_id, skipped, "subscriber lagged, refilling from store");
                        loop {
                            let batch = match store.events_after(&task_id, last_sequence, REPLAY_PAGE) {
                                Ok(batch) => batch,
                                Err(e) => {
                                    warn!(task_id, error = %e, "replay read failed, ending stream");
                                    return;
                                }
                            };
                            if batch.is_empty() {
                                break;
                            }
                            for event in batch {
                                last_sequence = event.sequence;
                                let terminal = event.kind.is_terminal();
                                yield StreamItem::Event(event);
                                if terminal {
                                    return;
                                }
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // 3. Producer cleaned up mid-subscription: drain the durable tail.
            loop {
                let batch = match store.events_after(&task_id, last_sequence, REPLAY_PAGE) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(task_id, error = %e, "tail read failed, ending stream");
                        return;
                    }
                };
                if batch.is_empty() {
                    return;
                }
                for event in batch {
                    last_sequence = event.sequence;
                    let terminal = event.kind.is_terminal();
                    yield StreamItem::Event(event);
                    if terminal {
                        return;
                    }
                }
            }
        }

        // Fallback: no live producer. Poll durable storage with heartbeats.
        debug!(task_id, after_sequence, "polling subscription (no live producer)");
        let poll_interval = Duration::from_millis(settings.poll_interval_ms);
        let heartbeat_interval = Duration::from_millis(settings.heartbeat_interval_ms);
        let idle_timeout = Duration::from_millis(settings.idle_timeout_ms);
        let mut last_activity = Instant::now();
        let mut last_heartbeat = Instant::now();

        loop {
            let batch = match store.events_after(&task_id, last_sequence, REPLAY_PAGE) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(task_id, error = %e, "poll read failed, ending stream");
                    return;
                }
            };

            if batch.is_empty() {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(task_id, "idle timeout, ending polling subscription");
                    return;
                }
                tokio::time::sleep(poll_interval).await;
                if last_heartbeat.elapsed() >= heartbeat_interval {
                    last_heartbeat = Instant::now();
                    yield StreamItem::Heartbeat;
                }
                continue;
            }

            last_activity = Instant::now();
            for event in batch {
                last_sequence = event.sequence;
                let terminal = event.kind.is_terminal();
                yield StreamItem::Event(event);
                if terminal {
                    return;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
