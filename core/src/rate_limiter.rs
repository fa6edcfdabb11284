//! Rate Limiter Module
//!
//! Keyed token buckets gating calls to external providers. Waiters for the
//! same key are served FIFO; buckets are created lazily and evicted after a
//! period with no traffic.
//!
//! Time comes from the tokio timer so paused-clock tests run instantly.

use crate::error::{VigilError, VigilResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Capacity and refill rate for one bucket
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 5.0,
        }
    }
}

/// Limiter-wide configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Settings applied to keys with no explicit entry
    pub default: RateLimitSettings,
    /// Per-key overrides (typically one per provider)
    pub per_key: HashMap<String, RateLimitSettings>,
    /// Buckets idle longer than this are dropped
    pub idle_ttl: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default: RateLimitSettings::default(),
            per_key: HashMap::new(),
            idle_ttl: Duration::from_secs(600),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

struct BucketEntry {
    settings: RateLimitSettings,
    /// FIFO turn lock: tokio's mutex wakes waiters in arrival order
    turn: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
}

impl BucketEntry {
    fn refill(&self, now: Instant) {
        let mut state = self.state.lock();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens =
            (state.tokens + elapsed * self.settings.refill_per_sec).min(self.settings.capacity);
        state.last_refill = now;
    }

    /// Deducts `n` tokens if available; otherwise returns the wait until they
    /// could be available.
    fn take_or_wait(&self, n: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        let mut state = self.state.lock();
        state.last_used = now;
        if state.tokens >= n {
            state.tokens -= n;
            Ok(())
        } else {
            let deficit = n - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.settings.refill_per_sec))
        }
    }
}

/// Token-bucket admission for external calls.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Arc<BucketEntry>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until `n` tokens are available for `key`, then deducts them.
    ///
    /// Returns `Cancelled` if the token fires first. Callers that need a hard
    /// deadline wrap this in `tokio::time::timeout`.
    pub async fn acquire(&self, key: &str, n: u32, cancel: &CancellationToken) -> VigilResult<()> {
        let entry = self.entry_for(key);
        let n = f64::from(n);
        if n > entry.settings.capacity {
            return Err(VigilError::validation(format!(
                "requested {} tokens exceeds bucket capacity {} for key {}",
                n, entry.settings.capacity, key
            )));
        }

        // Hold the turn for the whole wait so later arrivals queue behind us.
        let _turn = tokio::select! {
            guard = entry.turn.lock() => guard,
            _ = cancel.cancelled() => return Err(VigilError::Cancelled),
        };

        loop {
            match entry.take_or_wait(n, Instant::now()) {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(VigilError::Cancelled),
                    }
                }
            }
        }
    }

    /// Deducts `n` tokens if immediately available; never blocks.
    pub fn try_acquire(&self, key: &str, n: u32) -> bool {
        let entry = self.entry_for(key);
        entry.take_or_wait(f64::from(n), Instant::now()).is_ok()
    }

    /// Number of live buckets (monitoring / tests).
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    fn entry_for(&self, key: &str) -> Arc<BucketEntry> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        // Lazy eviction: drop buckets idle past the ttl with no one waiting.
        let ttl = self.config.idle_ttl;
        buckets.retain(|_, entry| {
            Arc::strong_count(entry) > 1
                || now.duration_since(entry.state.lock().last_used) < ttl
        });

        if let Some(entry) = buckets.get(key) {
            return entry.clone();
        }
        let settings = self
            .config
            .per_key
            .get(key)
            .copied()
            .unwrap_or(self.config.default);
        let entry = Arc::new(BucketEntry {
            settings,
            turn: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState {
                tokens: settings.capacity,
                last_refill: now,
                last_used: now,
            }),
        });
        buckets.insert(key.to_string(), entry.clone());
        entry
    }
}
