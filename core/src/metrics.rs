//! Metrics service
//!
//! Derived business and system metrics, rebuilt from the event stream. The
//! service holds no authoritative state: it consumes `incident.event` and
//! `provider.call` bus traffic, keeps windowed samples, and answers pull
//! queries. A periodic task pushes snapshots onto the bus.

use crate::bus::{BusMessage, BusStats, MessageBus, Priority, Subscriber};
use crate::clock::SharedClock;
use crate::event::StoredEvent;
use crate::hub::{HubStats, SubscriberHub};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bus topic carrying every stored incident event.
pub const INCIDENT_EVENT_TOPIC: &str = "incident.event";
/// Bus topic carrying one record per provider call.
pub const PROVIDER_CALL_TOPIC: &str = "provider.call";
/// Bus topic for periodic metric snapshots.
pub const METRICS_SNAPSHOT_TOPIC: &str = "metrics.snapshot";

const MTTR_MAX_SAMPLES: usize = 1000;
const MTTR_MAX_AGE_DAYS: i64 = 7;
const LATENCY_WINDOW: usize = 1024;
const BUCKET_SECONDS: i64 = 3600;

// ============================================================================
// Statistics helpers
// ============================================================================

/// Two-sided 95% critical value of Student's t for the given degrees of
/// freedom. Table lookup with the conventional steps; large df converges to
/// the normal 1.96.
fn t_value_95(df: usize) -> f64 {
    const TABLE: &[(usize, f64)] = &[
        (1, 12.706),
        (2, 4.303),
        (3, 3.182),
        (4, 2.776),
        (5, 2.571),
        (6, 2.447),
        (7, 2.365),
        (8, 2.306),
        (9, 2.262),
        (10, 2.228),
        (12, 2.179),
        (15, 2.131),
        (20, 2.086),
        (25, 2.060),
        (30, 2.042),
        (40, 2.021),
        (60, 2.000),
        (120, 1.980),
    ];
    if df == 0 {
        return f64::NAN;
    }
    for &(table_df, t) in TABLE.iter().rev() {
        if df >= table_df {
            return t;
        }
    }
    TABLE[0].1
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn sample_std(samples: &[f64], mean: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
        / (samples.len() - 1) as f64;
    var.sqrt()
}

/// Percentile over an unsorted window using nearest-rank on a sorted copy.
fn percentile(samples: &[f64], q: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MttrSnapshot {
    pub samples: usize,
    pub mean_ms: f64,
    /// 95% confidence half-width; zero with fewer than 2 samples
    pub ci95_half_width_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IncidentCounts {
    pub opened: u64,
    pub resolved: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketCounts {
    pub bucket_start: DateTime<Utc>,
    #[serde(flatten)]
    pub counts: IncidentCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallStats {
    pub provider: String,
    pub calls: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_micros: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub mttr: MttrSnapshot,
    pub totals: IncidentCounts,
    pub buckets: Vec<BucketCounts>,
    pub providers: Vec<ProviderCallStats>,
    pub subscribers: HubStats,
    pub bus: BusStats,
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Default)]
struct ProviderWindow {
    calls: u64,
    errors: u64,
    tokens_in: u64,
    tokens_out: u64,
    cost_micros: u64,
    latencies_ms: VecDeque<f64>,
}

#[derive(Default)]
struct MetricsState {
    mttr_samples: VecDeque<(DateTime<Utc>, f64)>,
    totals: IncidentCounts,
    buckets: HashMap<i64, IncidentCounts>,
    providers: HashMap<String, ProviderWindow>,
}

/// Rolling aggregates over the event stream.
pub struct MetricsService {
    clock: SharedClock,
    hub: SubscriberHub,
    bus: MessageBus,
    state: Mutex<MetricsState>,
}

impl MetricsService {
    pub fn new(clock: SharedClock, hub: SubscriberHub, bus: MessageBus) -> Arc<Self> {
        Arc::new(Self {
            clock,
            hub,
            bus,
            state: Mutex::new(MetricsState::default()),
        })
    }

    /// Subscribes the service to the bus topics it aggregates.
    pub fn attach(self: &Arc<Self>) {
        self.bus.subscribe(
            INCIDENT_EVENT_TOPIC,
            Arc::new(IncidentEventListener(self.clone())),
        );
        self.bus.subscribe(
            PROVIDER_CALL_TOPIC,
            Arc::new(ProviderCallListener(self.clone())),
        );
    }

    /// Periodically pushes snapshots under `metrics.snapshot`.
    pub fn start_publishing(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return,
                }
                let snapshot = service.snapshot();
                if let Ok(payload) = serde_json::to_value(&snapshot) {
                    service
                        .bus
                        .publish_json(METRICS_SNAPSHOT_TOPIC, Priority::Low, payload);
                }
            }
        });
    }

    /// Folds one stored event into the aggregates. Idempotent consumers
    /// dedup upstream; double counting here only skews rates, not truth.
    pub fn observe_event(&self, event: &StoredEvent) {
        let bucket = event.timestamp.timestamp().div_euclid(BUCKET_SECONDS) * BUCKET_SECONDS;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let counts = state.buckets.entry(bucket).or_default();
        match event.kind.as_str() {
            "incident_opened" => {
                counts.opened += 1;
                state.totals.opened += 1;
            }
            "incident_resolved" => {
                counts.resolved += 1;
                state.totals.resolved += 1;
                if let Some(duration_ms) = event.payload.get("duration_ms").and_then(|v| v.as_u64())
                {
                    state
                        .mttr_samples
                        .push_back((event.timestamp, duration_ms as f64));
                    Self::trim_mttr(&mut state.mttr_samples, self.clock.now());
                }
            }
            "incident_failed" => {
                counts.failed += 1;
                state.totals.failed += 1;
            }
            "incident_rejected" => {
                counts.rejected += 1;
                state.totals.rejected += 1;
            }
            "incident_cancelled" => {
                counts.cancelled += 1;
                state.totals.cancelled += 1;
            }
            _ => {}
        }
    }

    /// Folds one `provider.call` record into the per-provider windows.
    pub fn observe_provider_call(&self, payload: &serde_json::Value) {
        let Some(provider) = payload.get("provider").and_then(|v| v.as_str()) else {
            return;
        };
        let mut state = self.state.lock();
        let window = state.providers.entry(provider.to_string()).or_default();
        window.calls += 1;
        if payload.get("outcome").and_then(|v| v.as_str()) != Some("ok") {
            window.errors += 1;
        }
        window.tokens_in += payload.get("tokens_in").and_then(|v| v.as_u64()).unwrap_or(0);
        window.tokens_out += payload
            .get("tokens_out")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        window.cost_micros += payload
            .get("cost_micros")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if let Some(latency) = payload.get("latency_ms").and_then(|v| v.as_f64()) {
            window.latencies_ms.push_back(latency);
            while window.latencies_ms.len() > LATENCY_WINDOW {
                window.latencies_ms.pop_front();
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::trim_mttr(&mut state.mttr_samples, now);

        let samples: Vec<f64> = state.mttr_samples.iter().map(|(_, ms)| *ms).collect();
        let m = mean(&samples);
        let half_width = if samples.len() >= 2 {
            let std = sample_std(&samples, m);
            t_value_95(samples.len() - 1) * std / (samples.len() as f64).sqrt()
        } else {
            0.0
        };

        let mut buckets: Vec<BucketCounts> = state
            .buckets
            .iter()
            .map(|(start, counts)| BucketCounts {
                bucket_start: DateTime::from_timestamp(*start, 0).unwrap_or(now),
                counts: *counts,
            })
            .collect();
        buckets.sort_by_key(|b| b.bucket_start);

        let mut providers: Vec<ProviderCallStats> = state
            .providers
            .iter()
            .map(|(id, w)| {
                let lat: Vec<f64> = w.latencies_ms.iter().copied().collect();
                ProviderCallStats {
                    provider: id.clone(),
                    calls: w.calls,
                    errors: w.errors,
                    error_rate: if w.calls > 0 {
                        w.errors as f64 / w.calls as f64
                    } else {
                        0.0
                    },
                    tokens_in: w.tokens_in,
                    tokens_out: w.tokens_out,
                    cost_micros: w.cost_micros,
                    latency_p50_ms: percentile(&lat, 0.50),
                    latency_p95_ms: percentile(&lat, 0.95),
                    latency_p99_ms: percentile(&lat, 0.99),
                }
            })
            .collect();
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));

        MetricsSnapshot {
            generated_at: now,
            mttr: MttrSnapshot {
                samples: samples.len(),
                mean_ms: m,
                ci95_half_width_ms: half_width,
            },
            totals: state.totals,
            buckets,
            providers,
            subscribers: self.hub.stats(),
            bus: self.bus.stats(),
        }
    }

    fn trim_mttr(samples: &mut VecDeque<(DateTime<Utc>, f64)>, now: DateTime<Utc>) {
        while samples.len() > MTTR_MAX_SAMPLES {
            samples.pop_front();
        }
        let cutoff = now - chrono::Duration::days(MTTR_MAX_AGE_DAYS);
        while samples.front().is_some_and(|(t, _)| *t < cutoff) {
            samples.pop_front();
        }
    }
}

struct IncidentEventListener(Arc<MetricsService>);

#[async_trait::async_trait]
impl Subscriber for IncidentEventListener {
    async fn handle(&self, message: &BusMessage) -> Result<(), String> {
        let event: StoredEvent =
            serde_json::from_value(message.payload.clone()).map_err(|e| e.to_string())?;
        self.0.observe_event(&event);
        Ok(())
    }
}

struct ProviderCallListener(Arc<MetricsService>);

#[async_trait::async_trait]
impl Subscriber for ProviderCallListener {
    async fn handle(&self, message: &BusMessage) -> Result<(), String> {
        self.0.observe_provider_call(&message.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::clock::{Clock, ManualClock};
    use crate::event::Event;
    use crate::hub::HubConfig;

    fn service() -> (Arc<MetricsService>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default_start());
        let shared: SharedClock = clock.clone();
        let bus = MessageBus::new(BusConfig::default(), shared.clone());
        let hub = SubscriberHub::new(HubConfig::default(), shared.clone());
        (MetricsService::new(shared, hub, bus), clock)
    }

    fn resolved_event(clock: &ManualClock, duration_ms: u64) -> StoredEvent {
        StoredEvent::encode(
            "inc-1",
            0,
            clock.now(),
            &Event::IncidentResolved {
                resolved_at: clock.now(),
                duration_ms,
            },
        )
        .unwrap()
    }

    #[test]
    fn t_table_has_expected_anchors() {
        assert_eq!(t_value_95(1), 12.706);
        assert_eq!(t_value_95(2), 4.303);
        assert_eq!(t_value_95(10), 2.228);
        assert_eq!(t_value_95(200), 1.980);
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        let samples: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&samples, 0.50), 50.0);
        assert_eq!(percentile(&samples, 0.95), 95.0);
        assert_eq!(percentile(&samples, 0.99), 99.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[tokio::test]
    async fn mttr_mean_and_ci_match_hand_computation() {
        let (service, clock) = service();
        for ms in [100u64, 200, 300] {
            service.observe_event(&resolved_event(&clock, ms));
        }
        let snap = service.snapshot();
        assert_eq!(snap.mttr.samples, 3);
        assert!((snap.mttr.mean_ms - 200.0).abs() < 1e-9);
        // std = 100, n = 3, t(2) = 4.303 -> half width = 4.303 * 100 / sqrt(3)
        let expected = 4.303 * 100.0 / 3.0f64.sqrt();
        assert!((snap.mttr.ci95_half_width_ms - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn mttr_window_evicts_old_and_excess_samples() {
        let (service, clock) = service();
        service.observe_event(&resolved_event(&clock, 500));
        clock.advance(Duration::from_secs(8 * 24 * 3600));
        service.observe_event(&resolved_event(&clock, 100));
        let snap = service.snapshot();
        // The 8-day-old sample fell out of the 7-day window
        assert_eq!(snap.mttr.samples, 1);
        assert!((snap.mttr.mean_ms - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn counts_accumulate_per_bucket() {
        let (service, clock) = service();
        let opened = StoredEvent::encode(
            "inc-1",
            0,
            clock.now(),
            &Event::IncidentOpened {
                severity: crate::incident::Severity::High,
                fingerprint: "fp".into(),
                alert: crate::incident::Alert {
                    source: "monitoring".into(),
                    received_at: clock.now(),
                    payload: serde_json::json!({}),
                    signature: None,
                },
            },
        )
        .unwrap();
        service.observe_event(&opened);
        service.observe_event(&resolved_event(&clock, 1000));
        let rejected =
            StoredEvent::encode("inc-2", 5, clock.now(), &Event::IncidentRejected).unwrap();
        service.observe_event(&rejected);

        let snap = service.snapshot();
        assert_eq!(snap.totals.opened, 1);
        assert_eq!(snap.totals.resolved, 1);
        assert_eq!(snap.totals.rejected, 1);
        assert_eq!(snap.buckets.len(), 1);
        assert_eq!(snap.buckets[0].counts.opened, 1);
    }

    #[tokio::test]
    async fn provider_calls_aggregate_usage_and_errors() {
        let (service, _clock) = service();
        for i in 0..4 {
            service.observe_provider_call(&serde_json::json!({
                "provider": "openai",
                "outcome": if i == 3 { "error" } else { "ok" },
                "latency_ms": 100.0 * (i + 1) as f64,
                "tokens_in": 100,
                "tokens_out": 50,
                "cost_micros": 10,
            }));
        }
        let snap = service.snapshot();
        let p = &snap.providers[0];
        assert_eq!(p.calls, 4);
        assert_eq!(p.errors, 1);
        assert!((p.error_rate - 0.25).abs() < 1e-9);
        assert_eq!(p.tokens_in, 400);
        assert_eq!(p.cost_micros, 40);
        assert_eq!(p.latency_p50_ms, 200.0);
        assert_eq!(p.latency_p99_ms, 400.0);
    }
}
