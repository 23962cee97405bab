//! Subscription Bus — best-effort, in-memory fan-out of live events
//! (spec §2, §4.1).
//!
//! The bus never blocks a Worker: a slow or absent subscriber only ever
//! loses events, it never holds up emission. Durability is the Durable
//! Store's job; the bus exists purely to wake up push-stream sessions
//! promptly.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::Event;

/// Fan-out registry of per-task subscriber channels.
pub struct SubscriptionBus {
    channel_capacity: usize,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Event>>>>,
}

impl SubscriptionBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channel_capacity,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new subscriber for `task_id` and return its receiver.
    /// The returned channel has capacity `channel_capacity` (spec §4.1:
    /// "capacity ≥ 64").
    pub fn subscribe(&self, task_id: &str) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.subscribers
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish an event to every live subscriber of `event.task_id`.
    /// Full or closed channels are dropped silently — a lagging
    /// subscriber only misses events, it never blocks the Worker.
    pub fn publish(&self, event: &Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(senders) = subscribers.get_mut(&event.task_id) else {
            return;
        };

        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(task_id = %event.task_id, "subscriber lagging, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if senders.is_empty() {
            subscribers.remove(&event.task_id);
        }
    }

    /// Drop every subscriber for a task. Called once a Worker tears down
    /// so no dangling entry lingers in the map.
    pub fn close(&self, task_id: &str) {
        self.subscribers.lock().unwrap().remove(task_id);
    }

    #[cfg(test)]
    fn subscriber_count(&self, task_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(task_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, LogPayload};
    use chrono::Utc;

    fn sample_event(task_id: &str, id: u64) -> Event {
        Event {
            event_id: id,
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            stage_name: None,
            kind: EventKind::Log(LogPayload {
                message: "hi".into(),
            }),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = SubscriptionBus::new(64);
        let mut rx = bus.subscribe("t-1");

        bus.publish(&sample_event("t-1", 1));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_id, 1);
    }

    #[tokio::test]
    async fn publish_to_unknown_task_is_a_noop() {
        let bus = SubscriptionBus::new(64);
        bus.publish(&sample_event("nobody-subscribed", 1));
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = SubscriptionBus::new(64);
        let rx = bus.subscribe("t-1");
        drop(rx);

        bus.publish(&sample_event("t-1", 1));
        assert_eq!(bus.subscriber_count("t-1"), 0);
    }

    #[tokio::test]
    async fn close_removes_all_subscribers() {
        let bus = SubscriptionBus::new(64);
        let _rx = bus.subscribe("t-1");
        bus.close("t-1");
        assert_eq!(bus.subscriber_count("t-1"), 0);
    }
}
