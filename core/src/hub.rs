//! Subscriber hub
//!
//! Fan-out layer between the orchestrator and live dashboards. Each
//! subscriber owns a bounded queue drained by a flusher task that coalesces
//! events into batches. Slow subscribers never block producers: enqueue is
//! non-blocking under a per-subscriber lock, and overflow applies the
//! configured policy (drop-oldest or disconnect) with drops counted.

use crate::clock::SharedClock;
use crate::error::{VigilError, VigilResult};
use crate::event::StoredEvent;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Interest filter for one subscriber. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriberFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_ids: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<HashSet<String>>,
}

impl SubscriberFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        if let Some(ids) = &self.incident_ids {
            if !ids.contains(&event.incident_id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        true
    }
}

/// What to do when a subscriber queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Shed the oldest queued event (telemetry-grade subscribers)
    #[default]
    DropOldest,
    /// Sever the subscriber (critical consumers that must not miss events)
    Disconnect,
}

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub queue_depth: usize,
    pub batch_max_size: usize,
    pub batch_max_latency: Duration,
    pub overflow_policy: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            batch_max_size: 10,
            batch_max_latency: Duration::from_millis(100),
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Per-subscriber connection quality numbers
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub id: u64,
    pub queued: usize,
    pub drops: u64,
    pub mean_enqueue_micros: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Aggregate health exposed to the metrics service
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub subscribers: usize,
    pub total_drops: u64,
    pub disconnects: u64,
    pub mean_enqueue_micros: f64,
}

struct SubscriberState {
    id: u64,
    filter: SubscriberFilter,
    policy: OverflowPolicy,
    queue: Mutex<VecDeque<StoredEvent>>,
    notify: Notify,
    disconnected: AtomicBool,
    drops: AtomicU64,
    enqueue_ns: AtomicU64,
    enqueues: AtomicU64,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

struct HubInner {
    config: HubConfig,
    clock: SharedClock,
    subscribers: RwLock<HashMap<u64, Arc<SubscriberState>>>,
    next_id: AtomicU64,
    total_drops: AtomicU64,
    disconnects: AtomicU64,
    shutdown: CancellationToken,
}

/// Connection registry with batched fan-out.
#[derive(Clone)]
pub struct SubscriberHub {
    inner: Arc<HubInner>,
}

impl SubscriberHub {
    pub fn new(config: HubConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                clock,
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                total_drops: AtomicU64::new(0),
                disconnects: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Registers a subscriber; the stream yields event batches.
    pub fn subscribe(
        &self,
        filter: SubscriberFilter,
    ) -> (u64, mpsc::Receiver<Vec<StoredEvent>>) {
        self.subscribe_with_policy(filter, self.inner.config.overflow_policy)
    }

    /// Same as `subscribe`, with an explicit overflow policy for this
    /// subscriber (critical consumers ask for `Disconnect`).
    pub fn subscribe_with_policy(
        &self,
        filter: SubscriberFilter,
        policy: OverflowPolicy,
    ) -> (u64, mpsc::Receiver<Vec<StoredEvent>>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(SubscriberState {
            id,
            filter,
            policy,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            disconnected: AtomicBool::new(false),
            drops: AtomicU64::new(0),
            enqueue_ns: AtomicU64::new(0),
            enqueues: AtomicU64::new(0),
            last_heartbeat: Mutex::new(None),
        });
        self.inner.subscribers.write().insert(id, state.clone());

        let (tx, rx) = mpsc::channel(4);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            flusher(inner, state, tx).await;
        });
        (id, rx)
    }

    /// Removes a subscriber; idempotent.
    pub fn unsubscribe(&self, id: u64) {
        let removed = self.inner.subscribers.write().remove(&id);
        if let Some(state) = removed {
            state.disconnected.store(true, Ordering::SeqCst);
            state.notify.notify_one();
        }
    }

    /// Routes one event to every matching subscriber. Never blocks.
    pub fn publish(&self, event: &StoredEvent) {
        let targets: Vec<Arc<SubscriberState>> = {
            let subs = self.inner.subscribers.read();
            subs.values()
                .filter(|s| !s.disconnected.load(Ordering::Relaxed) && s.filter.matches(event))
                .cloned()
                .collect()
        };

        for state in targets {
            let started = std::time::Instant::now();
            let mut dropped = false;
            let mut disconnect = false;
            {
                let mut queue = state.queue.lock();
                if queue.len() >= self.inner.config.queue_depth {
                    match state.policy {
                        OverflowPolicy::DropOldest => {
                            queue.pop_front();
                            dropped = true;
                            queue.push_back(event.clone());
                        }
                        OverflowPolicy::Disconnect => {
                            disconnect = true;
                        }
                    }
                } else {
                    queue.push_back(event.clone());
                }
            }
            let elapsed = started.elapsed().as_nanos() as u64;
            state.enqueue_ns.fetch_add(elapsed, Ordering::Relaxed);
            state.enqueues.fetch_add(1, Ordering::Relaxed);

            if dropped {
                state.drops.fetch_add(1, Ordering::Relaxed);
                self.inner.total_drops.fetch_add(1, Ordering::Relaxed);
            }
            if disconnect {
                tracing::warn!(subscriber = state.id, "queue overflow, disconnecting subscriber");
                self.inner.disconnects.fetch_add(1, Ordering::Relaxed);
                self.unsubscribe(state.id);
                continue;
            }
            state.notify.notify_one();
        }
    }

    /// Records liveness for a subscriber (driven by wire-level pongs).
    pub fn heartbeat(&self, id: u64) -> VigilResult<()> {
        let subs = self.inner.subscribers.read();
        let state = subs.get(&id).ok_or_else(|| VigilError::NotFound {
            kind: "subscriber".into(),
            id: id.to_string(),
        })?;
        *state.last_heartbeat.lock() = Some(self.inner.clock.now());
        Ok(())
    }

    pub fn subscriber_stats(&self) -> Vec<SubscriberStats> {
        self.inner
            .subscribers
            .read()
            .values()
            .map(|s| SubscriberStats {
                id: s.id,
                queued: s.queue.lock().len(),
                drops: s.drops.load(Ordering::Relaxed),
                mean_enqueue_micros: mean_micros(
                    s.enqueue_ns.load(Ordering::Relaxed),
                    s.enqueues.load(Ordering::Relaxed),
                ),
                last_heartbeat: *s.last_heartbeat.lock(),
            })
            .collect()
    }

    pub fn stats(&self) -> HubStats {
        let subs = self.inner.subscribers.read();
        let (ns, count) = subs.values().fold((0u64, 0u64), |(ns, n), s| {
            (
                ns + s.enqueue_ns.load(Ordering::Relaxed),
                n + s.enqueues.load(Ordering::Relaxed),
            )
        });
        HubStats {
            subscribers: subs.len(),
            total_drops: self.inner.total_drops.load(Ordering::Relaxed),
            disconnects: self.inner.disconnects.load(Ordering::Relaxed),
            mean_enqueue_micros: mean_micros(ns, count),
        }
    }

    /// Stops every flusher; streams end after their final drain.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let subs: Vec<u64> = self.inner.subscribers.read().keys().copied().collect();
        for id in subs {
            self.unsubscribe(id);
        }
    }
}

fn mean_micros(ns: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        ns as f64 / count as f64 / 1000.0
    }
}

/// Drains one subscriber queue into batches: a batch ships when it reaches
/// `batch_max_size` or when `batch_max_latency` has elapsed since the first
/// queued event, whichever comes first.
async fn flusher(
    inner: Arc<HubInner>,
    state: Arc<SubscriberState>,
    tx: mpsc::Sender<Vec<StoredEvent>>,
) {
    let max_size = inner.config.batch_max_size;
    let max_latency = inner.config.batch_max_latency;

    loop {
        if state.disconnected.load(Ordering::SeqCst) {
            // Final drain so a disconnecting subscriber sees what it can
            let remainder: Vec<StoredEvent> = state.queue.lock().drain(..).collect();
            for chunk in remainder.chunks(max_size) {
                if tx.send(chunk.to_vec()).await.is_err() {
                    break;
                }
            }
            return;
        }

        if state.queue.lock().is_empty() {
            tokio::select! {
                _ = state.notify.notified() => {}
                _ = inner.shutdown.cancelled() => return,
            }
            continue;
        }

        // First event is in; wait for the batch to fill or the window to pass
        let window = tokio::time::sleep(max_latency);
        tokio::pin!(window);
        loop {
            if state.queue.lock().len() >= max_size
                || state.disconnected.load(Ordering::SeqCst)
            {
                break;
            }
            tokio::select! {
                _ = &mut window => break,
                _ = state.notify.notified() => {}
                _ = inner.shutdown.cancelled() => break,
            }
        }

        let batch: Vec<StoredEvent> = {
            let mut queue = state.queue.lock();
            let take = queue.len().min(max_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            continue;
        }
        if tx.send(batch).await.is_err() {
            // Receiver dropped; tear the subscriber down
            state.disconnected.store(true, Ordering::SeqCst);
            inner.subscribers.write().remove(&state.id);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::{Event, StoredEvent};
    use crate::incident::Phase;

    fn hub(config: HubConfig) -> SubscriberHub {
        SubscriberHub::new(config, Arc::new(ManualClock::default_start()))
    }

    fn event(incident_id: &str, sequence: u64) -> StoredEvent {
        StoredEvent::encode(
            incident_id,
            sequence,
            DateTime::parse_from_rfc3339("2025-10-25T12:00:00.000Z")
                .unwrap()
                .with_timezone(&Utc),
            &Event::PhaseEntered {
                phase: Phase::Detecting,
            },
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn batches_close_on_size() {
        let hub = hub(HubConfig::default());
        let (_id, mut rx) = hub.subscribe(SubscriberFilter::all());

        for seq in 0..25 {
            hub.publish(&event("inc-1", seq));
        }
        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 10);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.len(), 10);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_close_on_latency() {
        let hub = hub(HubConfig::default());
        let (_id, mut rx) = hub.subscribe(SubscriberFilter::all());

        hub.publish(&event("inc-1", 0));
        hub.publish(&event("inc-1", 1));
        // Under max_size; only the latency window closes the batch
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_oldest_keeps_latest_events() {
        let hub = hub(HubConfig {
            queue_depth: 4,
            batch_max_size: 10,
            ..HubConfig::default()
        });
        let (_id, mut rx) = hub.subscribe(SubscriberFilter::all());

        // Publish 10 in a burst before the flusher can drain: last 4 survive
        for seq in 0..10 {
            hub.publish(&event("inc-1", seq));
        }
        let batch = rx.recv().await.unwrap();
        let seqs: Vec<u64> = batch.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9]);

        let stats = hub.subscriber_stats();
        assert_eq!(stats[0].drops, 6);
        assert_eq!(hub.stats().total_drops, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_sees_sequences_in_order_despite_drops() {
        let hub = hub(HubConfig {
            queue_depth: 4,
            batch_max_size: 3,
            ..HubConfig::default()
        });
        let (_id, mut rx) = hub.subscribe(SubscriberFilter::all());

        for seq in 0..20 {
            hub.publish(&event("inc-1", seq));
        }
        let mut seen = Vec::new();
        while seen.len() < 4 {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(batch)) => seen.extend(batch.into_iter().map(|e| e.sequence)),
                _ => break,
            }
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seen, sorted, "sequences must be strictly increasing");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_policy_severs_subscriber() {
        let hub = hub(HubConfig {
            queue_depth: 2,
            overflow_policy: OverflowPolicy::Disconnect,
            ..HubConfig::default()
        });
        let (id, mut rx) = hub.subscribe(SubscriberFilter::all());

        for seq in 0..5 {
            hub.publish(&event("inc-1", seq));
        }
        // Queue of 2 absorbed, third publish severed the subscriber
        assert_eq!(hub.stats().disconnects, 1);
        assert_eq!(hub.stats().subscribers, 0);

        // The stream ends after the final drain
        let mut total = 0;
        while let Some(batch) = rx.recv().await {
            total += batch.len();
        }
        assert_eq!(total, 2);

        // Idempotent
        hub.unsubscribe(id);
    }

    #[tokio::test(start_paused = true)]
    async fn filters_route_by_incident_and_kind() {
        let hub = hub(HubConfig::default());
        let mut ids = HashSet::new();
        ids.insert("inc-2".to_string());
        let (_id, mut rx) = hub.subscribe(SubscriberFilter {
            incident_ids: Some(ids),
            kinds: None,
        });

        hub.publish(&event("inc-1", 0));
        hub.publish(&event("inc-2", 0));
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].incident_id, "inc-2");
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_is_idempotent_and_closes_stream() {
        let hub = hub(HubConfig::default());
        let (id, mut rx) = hub.subscribe(SubscriberFilter::all());
        hub.unsubscribe(id);
        hub.unsubscribe(id);
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.stats().subscribers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_is_tracked() {
        let hub = hub(HubConfig::default());
        let (id, _rx) = hub.subscribe(SubscriberFilter::all());
        hub.heartbeat(id).unwrap();
        let stats = hub.subscriber_stats();
        assert!(stats[0].last_heartbeat.is_some());
        assert!(hub.heartbeat(9999).is_err());
    }
}
