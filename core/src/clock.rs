//! Injectable time and identifier sources
//!
//! No component reads the system clock or generates ids directly; everything
//! goes through these traits so tests can drive time and get stable ids.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic-enough wall clock abstraction.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Collision-free identifier generation.
///
/// Ids are opaque strings of at most 64 bytes, lexicographically
/// time-ordered for a fixed prefix.
pub trait IdGen: Send + Sync {
    fn new_id(&self, prefix: &str) -> String;
}

/// Production clock backed by the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Production id generator: `<prefix>-<uuid v7>`.
///
/// UUID v7 embeds a millisecond timestamp in the high bits, so ids sort by
/// creation time within a prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn new_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, uuid::Uuid::now_v7())
    }
}

/// Test clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Convenience start point for tests that do not care about the date.
    pub fn default_start() -> Self {
        Self::new(
            DateTime::parse_from_rfc3339("2025-10-25T12:00:00.000Z")
                .expect("static timestamp")
                .with_timezone(&Utc),
        )
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock();
        *now += ChronoDuration::from_std(by).expect("advance within range");
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Test id generator producing `<prefix>-00000001`, `<prefix>-00000002`, ...
#[derive(Debug, Default)]
pub struct SeqIdGen {
    counter: AtomicU64,
}

impl SeqIdGen {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGen for SeqIdGen {
    fn new_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{:08}", prefix, n)
    }
}

/// Shared handle type used across constructors.
pub type SharedClock = Arc<dyn Clock>;
/// Shared handle type used across constructors.
pub type SharedIdGen = Arc<dyn IdGen>;
