//! Circuit breaker
//!
//! Per-dependency failure gate with closed/open/half-open states. The lock
//! covers state transitions only; the guarded operation runs outside it so
//! concurrent calls never serialize on each other's work.

use crate::clock::SharedClock;
use crate::error::{VigilError, VigilResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for one breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures in the rolling window that trip the breaker
    pub failure_threshold: u32,
    /// Rolling window length
    pub window: Duration,
    /// Open -> HalfOpen cooldown
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Read-only view for monitoring
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: BreakerState,
    pub failures_in_window: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

/// Per-dependency circuit breaker.
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Runs `op` if the breaker admits the call.
    ///
    /// Returns `CircuitOpen` without invoking `op` when fenced. Timeouts and
    /// transport/5xx provider errors count against the rolling window; other
    /// errors pass through without affecting breaker health (the dependency
    /// answered, even if it said no).
    pub async fn call<T, F, Fut>(&self, op: F) -> VigilResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VigilResult<T>>,
    {
        self.admit()?;
        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) if Self::counts_as_failure(err) => self.record_failure(),
            Err(_) => self.record_success(),
        }
        result
    }

    /// Current state for monitoring; never blocks on in-flight work.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Self::prune_window(&mut inner, now, self.config.window);
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: inner.state,
            failures_in_window: inner.failures.len() as u32,
            opened_at: inner.opened_at,
        }
    }

    fn counts_as_failure(err: &VigilError) -> bool {
        match err {
            VigilError::Timeout { .. } | VigilError::Transport { .. } => true,
            VigilError::Provider { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn admit(&self) -> VigilResult<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened = inner.opened_at.unwrap_or(now);
                let elapsed = (now - opened)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(dependency = %self.dependency, "breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(VigilError::CircuitOpen {
                        dependency: self.dependency.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(VigilError::CircuitOpen {
                        dependency: self.dependency.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::info!(dependency = %self.dependency, "breaker closed after successful probe");
            }
            BreakerState::Closed => {
                let now = self.clock.now();
                Self::prune_window(&mut inner, now, self.config.window);
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                tracing::warn!(dependency = %self.dependency, "probe failed, breaker re-opened");
            }
            BreakerState::Closed => {
                inner.failures.push_back(now);
                Self::prune_window(&mut inner, now, self.config.window);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                    tracing::warn!(
                        dependency = %self.dependency,
                        threshold = self.config.failure_threshold,
                        "failure threshold reached, breaker opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    fn prune_window(inner: &mut Inner, now: DateTime<Utc>, window: Duration) {
        let cutoff = now
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60));
        while inner
            .failures
            .front()
            .is_some_and(|&t| t < cutoff)
        {
            inner.failures.pop_front();
        }
    }
}

/// Lazily-created breakers keyed by dependency name.
///
/// Dependencies without an explicit config entry get the default config.
pub struct BreakerRegistry {
    clock: SharedClock,
    default: BreakerConfig,
    configs: std::collections::HashMap<String, BreakerConfig>,
    breakers: Mutex<std::collections::HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(
        clock: SharedClock,
        default: BreakerConfig,
        configs: std::collections::HashMap<String, BreakerConfig>,
    ) -> Self {
        Self {
            clock,
            default,
            configs,
            breakers: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn breaker(&self, dependency: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        if let Some(b) = breakers.get(dependency) {
            return b.clone();
        }
        let config = self
            .configs
            .get(dependency)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        let breaker = std::sync::Arc::new(CircuitBreaker::new(
            dependency,
            config,
            self.clock.clone(),
        ));
        breakers.insert(dependency.to_string(), breaker.clone());
        breaker
    }

    /// Snapshots of every breaker created so far, for health reporting.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .lock()
            .values()
            .map(|b| b.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("provider-x", BreakerConfig::default(), clock)
    }

    async fn failing_call(breaker: &CircuitBreaker, hits: &AtomicU32) -> VigilResult<()> {
        breaker
            .call(|| async {
                hits.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(VigilError::Timeout {
                    operation: "invoke".into(),
                    elapsed: Duration::from_secs(5),
                })
            })
            .await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fences_calls() {
        let clock = Arc::new(ManualClock::default_start());
        let cb = breaker(clock.clone());
        let hits = AtomicU32::new(0);

        for _ in 0..5 {
            let _ = failing_call(&cb, &hits).await;
        }
        assert_eq!(cb.snapshot().state, BreakerState::Open);
        assert_eq!(hits.load(Ordering::SeqCst), 5);

        // Fenced: the dependency is not touched
        let err = failing_call(&cb, &hits).await.unwrap_err();
        assert!(matches!(err, VigilError::CircuitOpen { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn probe_after_cooldown_closes_on_success() {
        let clock = Arc::new(ManualClock::default_start());
        let cb = breaker(clock.clone());
        let hits = AtomicU32::new(0);

        for _ in 0..5 {
            let _ = failing_call(&cb, &hits).await;
        }
        // 29s: still fenced
        clock.advance(Duration::from_secs(29));
        assert!(matches!(
            failing_call(&cb, &hits).await.unwrap_err(),
            VigilError::CircuitOpen { .. }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 5);

        // 30s: probe reaches the dependency and succeeds
        clock.advance(Duration::from_secs(1));
        let res: VigilResult<u32> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
        let snap = cb.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failures_in_window, 0);
    }

    #[tokio::test]
    async fn probe_failure_restarts_cooldown() {
        let clock = Arc::new(ManualClock::default_start());
        let cb = breaker(clock.clone());
        let hits = AtomicU32::new(0);

        for _ in 0..5 {
            let _ = failing_call(&cb, &hits).await;
        }
        clock.advance(Duration::from_secs(30));
        let _ = failing_call(&cb, &hits).await; // probe fails
        assert_eq!(cb.snapshot().state, BreakerState::Open);
        assert_eq!(hits.load(Ordering::SeqCst), 6);

        // Fenced again until the new cooldown elapses
        assert!(matches!(
            failing_call(&cb, &hits).await.unwrap_err(),
            VigilError::CircuitOpen { .. }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn answered_errors_do_not_trip_the_breaker() {
        let clock = Arc::new(ManualClock::default_start());
        let cb = breaker(clock);
        for _ in 0..10 {
            let res: VigilResult<()> = cb
                .call(|| async {
                    Err(VigilError::Provider {
                        status: 400,
                        message: "bad request".into(),
                    })
                })
                .await;
            assert!(res.is_err());
        }
        assert_eq!(cb.snapshot().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn old_failures_fall_out_of_the_window() {
        let clock = Arc::new(ManualClock::default_start());
        let cb = breaker(clock.clone());
        let hits = AtomicU32::new(0);

        for _ in 0..4 {
            let _ = failing_call(&cb, &hits).await;
        }
        clock.advance(Duration::from_secs(61));
        let _ = failing_call(&cb, &hits).await;
        // Only one failure in the current window
        let snap = cb.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failures_in_window, 1);
    }
}
