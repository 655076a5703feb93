use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Default per-subscriber queue capacity.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Event topics. Terminal topics are keyed per session id so a view attached
/// to one terminal never receives another terminal's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    TerminalOutput(String),
    TerminalTitleChanged,
    TerminalExited,
    TerminalLatency,
    AuthSession,
    Sync,
    Tunnel,
}

/// Typed event payloads published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    TerminalOutput {
        session_id: String,
        #[serde(with = "serde_bytes_b64")]
        data: Vec<u8>,
    },
    TerminalReady {
        session_id: String,
        title: String,
    },
    TerminalTitleChanged {
        session_id: String,
        title: String,
    },
    TerminalExited {
        session_id: String,
        exit_code: Option<i32>,
        reason: Option<String>,
    },
    TerminalLatency {
        session_id: String,
        latency_ms: u64,
    },
    SessionSetup {
        device_id: String,
    },
    SessionUnlocked {
        via_auto_unlock: bool,
    },
    SessionLocked {
        reason: LockReason,
    },
    AutoUnlockAttempted {
        ok: bool,
        error: Option<String>,
    },
    SyncStarted {
        database_id: String,
        direction: String,
    },
    SyncProgress {
        database_id: String,
        entity: String,
        processed: u64,
    },
    SyncCompleted {
        database_id: String,
        ok: bool,
        records_synced: u64,
        conflicts_resolved: u64,
        conflicts_pending: u64,
    },
    TunnelStarted {
        tunnel_id: String,
    },
    TunnelStopped {
        tunnel_id: String,
    },
    TunnelStatusChanged {
        tunnel_id: String,
        status: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    Manual,
    Timeout,
    Shutdown,
}

mod serde_bytes_b64 {
    use base64::engine::general_purpose;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

struct SubscriberQueue {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicUsize,
}

impl SubscriberQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        // The lock is only ever held for a push/pop, never across await.
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop(&self) -> Option<Event> {
        self.lock().pop_front()
    }

    fn push(&self, event: Event) -> bool {
        let mut queue = self.lock();
        let mut dropped = false;
        if queue.len() >= self.capacity {
            queue.pop_front();
            dropped = true;
        }
        queue.push_back(event);
        dropped
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    topic: Topic,
    queue: Arc<SubscriberQueue>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Receive the next event, waiting if the queue is empty. Returns `None`
    /// once the bus shuts the topic down.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) != 0 {
                return None;
            }
            notified.await;
        }
    }

    /// Pop an event without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.pop()
    }

    /// Cumulative count of events dropped for this subscriber because its
    /// queue was full when the producer published.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(mut subscribers) = self.bus.topics.get_mut(&self.topic) {
            subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

struct BusInner {
    topics: DashMap<Topic, Vec<(u64, Arc<SubscriberQueue>)>>,
    next_id: AtomicU64,
}

/// Topic-keyed fan-out bus. Publishing never blocks on a slow subscriber:
/// a full subscriber queue drops its oldest entry and bumps the drop count.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to a topic with the default queue capacity.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.subscribe_with_capacity(topic, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, topic: Topic, capacity: usize) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicUsize::new(0),
        });

        self.inner
            .topics
            .entry(topic.clone())
            .or_default()
            .push((id, queue.clone()));

        Subscription {
            id,
            topic,
            queue,
            bus: self.inner.clone(),
        }
    }

    /// Publish an event to every subscriber of `topic`, in order per topic.
    pub fn publish(&self, topic: &Topic, event: Event) {
        let Some(subscribers) = self.inner.topics.get(topic) else {
            return;
        };

        for (_, subscriber) in subscribers.iter() {
            if subscriber.push(event.clone()) {
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
            }
            subscriber.notify.notify_one();
        }
    }

    /// Close a topic: wakes all of its subscribers with end-of-stream.
    pub fn close_topic(&self, topic: &Topic) {
        if let Some((_, subscribers)) = self.inner.topics.remove(topic) {
            for (_, subscriber) in subscribers {
                subscriber.closed.store(1, Ordering::Release);
                subscriber.notify.notify_waiters();
            }
        }
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Timestamped wrapper used by persistence-side consumers of the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus = EventBus::new();
        let topic = Topic::TerminalOutput("t1".into());
        let sub = bus.subscribe(topic.clone());

        for i in 0..3u8 {
            bus.publish(
                &topic,
                Event::TerminalOutput {
                    session_id: "t1".into(),
                    data: vec![i],
                },
            );
        }

        for i in 0..3u8 {
            match sub.recv().await.unwrap() {
                Event::TerminalOutput { data, .. } => assert_eq!(data, vec![i]),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new();
        let topic = Topic::TerminalOutput("t1".into());
        let sub = bus.subscribe_with_capacity(topic.clone(), 2);

        for i in 0..5u8 {
            bus.publish(
                &topic,
                Event::TerminalOutput {
                    session_id: "t1".into(),
                    data: vec![i],
                },
            );
        }

        assert_eq!(sub.dropped(), 3);
        // The two newest frames survive.
        match sub.recv().await.unwrap() {
            Event::TerminalOutput { data, .. } => assert_eq!(data, vec![3]),
            other => panic!("unexpected event {:?}", other),
        }
        match sub.recv().await.unwrap() {
            Event::TerminalOutput { data, .. } => assert_eq!(data, vec![4]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsubscribe_on_drop() {
        let bus = EventBus::new();
        let topic = Topic::Sync;
        let sub = bus.subscribe(topic.clone());
        assert_eq!(bus.subscriber_count(&topic), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn close_topic_ends_stream() {
        let bus = EventBus::new();
        let topic = Topic::TerminalOutput("t9".into());
        let sub = bus.subscribe(topic.clone());
        bus.close_topic(&topic);
        assert!(sub.recv().await.is_none());
    }
}
