//! Message bus
//!
//! Topic-addressed in-process pub/sub. Delivery per topic is priority-first,
//! FIFO within a priority. Failed deliveries retry with the shared backoff
//! policy and land on the dead-letter topic after exhaustion. Durability for
//! events that must survive restart belongs to the event store, not here.

use crate::clock::SharedClock;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Topic receiving messages that exhausted their delivery attempts.
pub const DEAD_LETTER_TOPIC: &str = "dead_letter";

/// Delivery priority, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// A published message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    /// Earliest delivery time; None delivers immediately
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Messages past this instant are dropped, not delivered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Delivery attempt counter, starting at 1
    pub attempt: u32,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, priority: Priority, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            priority,
            payload,
            not_before: None,
            expires_at: None,
            attempt: 1,
        }
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// A topic subscriber. Returning `Err` triggers the retry path.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> Result<(), String>;
}

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Delivery attempts per subscriber before dead-lettering
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Fixed seed for jitter in tests; None seeds from entropy
    pub rng_seed: Option<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry: RetryPolicy::default(),
            rng_seed: None,
        }
    }
}

/// Delivery counters, cheap to read for metrics.
#[derive(Debug, Default)]
pub struct BusCounters {
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub expired: AtomicU64,
    pub dead_lettered: AtomicU64,
}

/// Snapshot of the counters
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub delivered: u64,
    pub retried: u64,
    pub expired: u64,
    pub dead_lettered: u64,
}

struct QueuedMessage {
    seq: u64,
    message: BusMessage,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedMessage {}
impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedMessage {
    // BinaryHeap is a max-heap: greater means delivered sooner.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .message
            .priority
            .rank()
            .cmp(&self.message.priority.rank())
            .then(other.seq.cmp(&self.seq))
    }
}

struct TopicState {
    heap: Mutex<BinaryHeap<QueuedMessage>>,
    notify: Notify,
    subscribers: Mutex<HashMap<u64, Arc<dyn Subscriber>>>,
}

struct BusInner {
    config: BusConfig,
    clock: SharedClock,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    counters: BusCounters,
    seq: AtomicU64,
    sub_ids: AtomicU64,
    rng: Mutex<StdRng>,
    shutdown: CancellationToken,
}

/// Handle returned by `subscribe`; unsubscribing is idempotent.
pub struct SubscriptionHandle {
    topic: String,
    id: u64,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.bus.upgrade() {
            let topics = inner.topics.lock();
            if let Some(topic) = topics.get(&self.topic) {
                topic.subscribers.lock().remove(&self.id);
            }
        }
    }
}

/// Durable-enough intra-process broker.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig, clock: SharedClock) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            inner: Arc::new(BusInner {
                config,
                clock,
                topics: Mutex::new(HashMap::new()),
                counters: BusCounters::default(),
                seq: AtomicU64::new(0),
                sub_ids: AtomicU64::new(0),
                rng: Mutex::new(rng),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers a subscriber on a topic.
    pub fn subscribe(&self, topic: &str, subscriber: Arc<dyn Subscriber>) -> SubscriptionHandle {
        let state = self.topic_state(topic);
        let id = self.inner.sub_ids.fetch_add(1, Ordering::SeqCst);
        state.subscribers.lock().insert(id, subscriber);
        SubscriptionHandle {
            topic: topic.to_string(),
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publishes one message.
    pub fn publish(&self, message: BusMessage) {
        self.publish_many(vec![message]);
    }

    /// Publishes a batch atomically with respect to ordering: all messages
    /// are enqueued before the topic workers are woken, so priority ordering
    /// holds across the whole batch.
    pub fn publish_many(&self, messages: Vec<BusMessage>) {
        let mut touched: Vec<Arc<TopicState>> = Vec::new();
        for message in messages {
            let state = self.topic_state(&message.topic);
            let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
            state.heap.lock().push(QueuedMessage { seq, message });
            if !touched.iter().any(|t| Arc::ptr_eq(t, &state)) {
                touched.push(state);
            }
        }
        for state in touched {
            state.notify.notify_one();
        }
    }

    /// Convenience publish with just topic/priority/payload.
    pub fn publish_json(&self, topic: &str, priority: Priority, payload: serde_json::Value) {
        self.publish(BusMessage::new(topic, priority, payload));
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Stops all topic workers. In-flight retries finish their current sleep
    /// and then observe the token.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn topic_state(&self, topic: &str) -> Arc<TopicState> {
        let mut topics = self.inner.topics.lock();
        if let Some(state) = topics.get(topic) {
            return state.clone();
        }
        let state = Arc::new(TopicState {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            subscribers: Mutex::new(HashMap::new()),
        });
        topics.insert(topic.to_string(), state.clone());
        let worker_state = state.clone();
        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            topic_worker(worker_state, inner, shutdown).await;
        });
        state
    }
}

async fn topic_worker(
    state: Arc<TopicState>,
    inner: Weak<BusInner>,
    shutdown: CancellationToken,
) {
    loop {
        let next = state.heap.lock().pop();
        let Some(queued) = next else {
            tokio::select! {
                _ = state.notify.notified() => continue,
                _ = shutdown.cancelled() => return,
            }
        };
        let Some(bus) = inner.upgrade() else { return };
        deliver(bus, &state, queued, &shutdown).await;
    }
}

async fn deliver(
    bus: Arc<BusInner>,
    state: &Arc<TopicState>,
    queued: QueuedMessage,
    shutdown: &CancellationToken,
) {
    let now = bus.clock.now();
    let message = queued.message;

    if message.expires_at.is_some_and(|at| at <= now) {
        bus.counters.expired.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(topic = %message.topic, "dropping expired message");
        return;
    }

    if let Some(not_before) = message.not_before {
        if not_before > now {
            // Park the message off-queue so it does not block the topic.
            let wait = (not_before - now).to_std().unwrap_or_default();
            let state = state.clone();
            let seq = queued.seq;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let mut parked = message;
                        parked.not_before = None;
                        state.heap.lock().push(QueuedMessage { seq, message: parked });
                        state.notify.notify_one();
                    }
                    _ = shutdown.cancelled() => {}
                }
            });
            return;
        }
    }

    let targets: Vec<Arc<dyn Subscriber>> = state.subscribers.lock().values().cloned().collect();
    for subscriber in targets {
        match subscriber.handle(&message).await {
            Ok(()) => {
                bus.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::debug!(topic = %message.topic, error = %err, "delivery failed, scheduling retry");
                spawn_retry(bus.clone(), subscriber, message.clone(), shutdown.clone());
            }
        }
    }
}

fn spawn_retry(
    bus: Arc<BusInner>,
    subscriber: Arc<dyn Subscriber>,
    message: BusMessage,
    shutdown: CancellationToken,
) {
    // Dead-letter deliveries are final: no retry loops on the DLQ itself.
    if message.topic == DEAD_LETTER_TOPIC {
        return;
    }
    tokio::spawn(async move {
        let mut message = message;
        let mut last_error = String::new();
        while message.attempt < bus.config.max_attempts {
            let delay = {
                let mut rng = bus.rng.lock();
                bus.config.retry.delay_for_attempt(message.attempt, &mut *rng)
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
            message.attempt += 1;
            bus.counters.retried.fetch_add(1, Ordering::Relaxed);
            match subscriber.handle(&message).await {
                Ok(()) => {
                    bus.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => last_error = err,
            }
        }
        bus.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            topic = %message.topic,
            attempts = message.attempt,
            error = %last_error,
            "delivery exhausted, dead-lettering"
        );
        let dead = BusMessage::new(
            DEAD_LETTER_TOPIC,
            Priority::High,
            serde_json::json!({
                "original_topic": message.topic,
                "payload": message.payload,
                "attempts": message.attempt,
                "error": last_error,
            }),
        );
        // Re-enter through the public path so DLQ subscribers see it.
        let bus = MessageBus { inner: bus };
        bus.publish(dead);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<BusMessage>>,
        fail_first: AtomicU64,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_first: AtomicU64::new(0),
            })
        }

        fn failing(times: u64) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_first: AtomicU64::new(times),
            })
        }

        fn payloads(&self) -> Vec<serde_json::Value> {
            self.seen.lock().iter().map(|m| m.payload.clone()).collect()
        }
    }

    #[async_trait]
    impl Subscriber for Recorder {
        async fn handle(&self, message: &BusMessage) -> Result<(), String> {
            self.seen.lock().push(message.clone());
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err("induced failure".into());
            }
            Ok(())
        }
    }

    fn bus() -> (MessageBus, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default_start());
        let bus = MessageBus::new(
            BusConfig {
                rng_seed: Some(7),
                ..BusConfig::default()
            },
            clock.clone(),
        );
        (bus, clock)
    }

    async fn settle() {
        // Sleeping parks the test task so paused time auto-advances through
        // every pending worker/retry timer.
        tokio::time::sleep(Duration::from_secs(120)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn priority_first_fifo_within() {
        let (bus, _clock) = bus();
        let rec = Recorder::new();
        bus.subscribe("t", rec.clone());

        bus.publish_many(vec![
            BusMessage::new("t", Priority::Low, serde_json::json!(1)),
            BusMessage::new("t", Priority::Critical, serde_json::json!(2)),
            BusMessage::new("t", Priority::Medium, serde_json::json!(3)),
            BusMessage::new("t", Priority::Critical, serde_json::json!(4)),
        ]);
        settle().await;

        assert_eq!(
            rec.payloads(),
            vec![
                serde_json::json!(2),
                serde_json::json!(4),
                serde_json::json!(3),
                serde_json::json!(1)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_retries_then_succeeds() {
        let (bus, _clock) = bus();
        let rec = Recorder::failing(2);
        bus.subscribe("t", rec.clone());

        bus.publish_json("t", Priority::Medium, serde_json::json!("x"));
        settle().await;

        // 1 initial + 2 retries, last one succeeding
        assert_eq!(rec.seen.lock().len(), 3);
        let stats = bus.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.dead_lettered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delivery_dead_letters() {
        let (bus, _clock) = bus();
        let rec = Recorder::failing(u64::MAX);
        let dlq = Recorder::new();
        bus.subscribe("t", rec.clone());
        bus.subscribe(DEAD_LETTER_TOPIC, dlq.clone());

        bus.publish_json("t", Priority::Medium, serde_json::json!({"v": 1}));
        settle().await;

        assert_eq!(rec.seen.lock().len(), 5); // max_attempts
        let dead = dlq.seen.lock();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload["original_topic"], "t");
        assert_eq!(dead[0].payload["attempts"], 5);
        assert_eq!(bus.stats().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dropped_and_counted() {
        let (bus, clock) = bus();
        let rec = Recorder::new();
        bus.subscribe("t", rec.clone());

        let past = clock.now() - chrono::Duration::seconds(1);
        bus.publish(BusMessage::new("t", Priority::High, serde_json::json!("old")).expires_at(past));
        settle().await;

        assert!(rec.seen.lock().is_empty());
        assert_eq!(bus.stats().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_is_idempotent() {
        let (bus, _clock) = bus();
        let rec = Recorder::new();
        let handle = bus.subscribe("t", rec.clone());
        handle.unsubscribe();
        handle.unsubscribe();

        bus.publish_json("t", Priority::Medium, serde_json::json!(1));
        settle().await;
        assert!(rec.seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_waits_for_not_before() {
        let (bus, clock) = bus();
        let rec = Recorder::new();
        bus.subscribe("t", rec.clone());

        let later = clock.now() + chrono::Duration::milliseconds(500);
        bus.publish(BusMessage::new("t", Priority::Medium, serde_json::json!("later")).not_before(later));
        bus.publish_json("t", Priority::Low, serde_json::json!("now"));
        settle().await;

        // The delayed message must not block the topic
        assert_eq!(rec.payloads()[0], serde_json::json!("now"));
        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(rec.seen.lock().len(), 2);
    }
}
