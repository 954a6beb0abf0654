//! Log Bus - in-process pub/sub of structured log events
//!
//! One publisher, N subscribers. Every subscriber owns a bounded queue;
//! overflow drops that subscriber's oldest event, so a slow consumer never
//! blocks the publisher or starves the others.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

/// Default per-subscriber queue bound
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Event severity; `Silent` subscribers receive nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "silent" => Some(LogLevel::Silent),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }
}

/// One published event
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub payload: String,
    #[serde(skip)]
    pub timestamp: u64,
}

struct SubscriberQueue {
    level: LogLevel,
    buf: Mutex<VecDeque<LogEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// The bus itself; cheap to clone handles via `Arc`
pub struct LogBus {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl LogBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            capacity,
        }
    }

    /// Register a subscriber that sees events at `level` and above
    pub fn subscribe(self: &Arc<Self>, level: LogLevel) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue {
            level,
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.capacity,
        });
        self.subscribers.lock().insert(id, Arc::clone(&queue));
        Subscription {
            id,
            queue,
            bus: Arc::clone(self),
        }
    }

    /// Remove a subscriber. Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        if let Some(queue) = self.subscribers.lock().remove(&id) {
            queue.closed.store(true, Ordering::SeqCst);
            queue.notify.notify_waiters();
        }
    }

    /// Publish one event; never blocks
    pub fn publish(&self, level: LogLevel, payload: impl Into<String>) {
        if level == LogLevel::Silent {
            return;
        }
        let event = LogEvent {
            level,
            payload: payload.into(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };

        let subscribers = self.subscribers.lock();
        for queue in subscribers.values() {
            if level < queue.level {
                continue;
            }
            let mut buf = queue.buf.lock();
            if buf.len() >= queue.capacity {
                buf.pop_front();
            }
            buf.push_back(event.clone());
            drop(buf);
            queue.notify.notify_one();
        }
    }

    pub fn debug(&self, payload: impl Into<String>) {
        self.publish(LogLevel::Debug, payload);
    }

    pub fn info(&self, payload: impl Into<String>) {
        self.publish(LogLevel::Info, payload);
    }

    pub fn warning(&self, payload: impl Into<String>) {
        self.publish(LogLevel::Warning, payload);
    }

    pub fn error(&self, payload: impl Into<String>) {
        self.publish(LogLevel::Error, payload);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// A live subscription; unsubscribes itself when dropped
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Arc<LogBus>,
}

impl Subscription {
    /// Receive the next event; `None` after unsubscription
    pub async fn recv(&self) -> Option<LogEvent> {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.buf.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Drain without waiting
    pub fn try_recv(&self) -> Option<LogEvent> {
        self.queue.buf.lock().pop_front()
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive_in_order() {
        let bus = Arc::new(LogBus::default());
        let sub = bus.subscribe(LogLevel::Debug);

        bus.info("one");
        bus.info("two");

        assert_eq!(sub.recv().await.unwrap().payload, "one");
        assert_eq!(sub.recv().await.unwrap().payload, "two");
    }

    #[tokio::test]
    async fn test_level_filter() {
        let bus = Arc::new(LogBus::default());
        let sub = bus.subscribe(LogLevel::Warning);

        bus.debug("noise");
        bus.info("noise");
        bus.warning("kept");
        bus.error("also kept");

        assert_eq!(sub.recv().await.unwrap().payload, "kept");
        assert_eq!(sub.recv().await.unwrap().payload, "also kept");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_silent_subscriber_gets_nothing() {
        let bus = Arc::new(LogBus::default());
        let sub = bus.subscribe(LogLevel::Silent);
        bus.error("anything");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_only() {
        // A full queue drops its own oldest events; a fast
        // subscriber still sees everything in order.
        let bus = Arc::new(LogBus::new(4));
        let slow = bus.subscribe(LogLevel::Debug);
        let fast = bus.subscribe(LogLevel::Debug);

        // The fast subscriber keeps up; the slow one never drains
        let mut fast_seen = Vec::new();
        for i in 0..10 {
            bus.info(format!("event-{}", i));
            if let Some(event) = fast.try_recv() {
                fast_seen.push(event.payload);
            }
        }
        while let Some(event) = fast.try_recv() {
            fast_seen.push(event.payload);
        }
        let expected: Vec<String> = (0..10).map(|i| format!("event-{}", i)).collect();
        assert_eq!(fast_seen, expected);

        // Slow subscriber: only the newest 4 survive, oldest were dropped
        let mut slow_seen = Vec::new();
        while let Some(event) = slow.try_recv() {
            slow_seen.push(event.payload);
        }
        assert_eq!(slow_seen, vec!["event-6", "event-7", "event-8", "event-9"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = Arc::new(LogBus::default());
        let sub = bus.subscribe(LogLevel::Debug);
        let id = sub.id();

        bus.unsubscribe(id);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = Arc::new(LogBus::default());
        {
            let _sub = bus.subscribe(LogLevel::Debug);
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
