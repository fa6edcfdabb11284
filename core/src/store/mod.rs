//! Event store
//!
//! Append-only ordered log of incident events with optimistic concurrency.
//! Physical storage is pluggable behind the `EventStore` trait; the in-memory
//! implementation here is the default for a single-process deployment and for
//! tests. Permanent truth is the event stream, not the in-memory aggregates.

mod memory;

pub use memory::MemoryEventStore;

use crate::error::VigilResult;
use crate::event::{Event, StoredEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Replay position for a tail subscription.
#[derive(Debug, Clone)]
pub struct ReplayFrom {
    pub incident_id: String,
    pub from_sequence: u64,
}

/// Ordered stream of stored events: optional replay, then the live tail.
///
/// Delivery is at-least-once across the replay/tail seam; consumers
/// deduplicate by `(incident_id, sequence)`.
pub struct EventStream {
    rx: mpsc::Receiver<StoredEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<StoredEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<StoredEvent> {
        self.rx.recv().await
    }
}

impl futures::Stream for EventStream {
    type Item = StoredEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Append-only ordered incident-event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically appends `events` for one incident.
    ///
    /// `expected_sequence` is the sequence the first new event must get
    /// (i.e. the current head). Returns the new head sequence. Fails with
    /// `Conflict` when the store has moved past `expected_sequence`.
    async fn append(
        &self,
        incident_id: &str,
        expected_sequence: u64,
        events: &[Event],
    ) -> VigilResult<u64>;

    /// Reads up to `limit` events with sequence >= `from_sequence`, ascending.
    /// Content hashes are verified; a mismatch surfaces `Corruption`.
    async fn read(
        &self,
        incident_id: &str,
        from_sequence: u64,
        limit: usize,
    ) -> VigilResult<Vec<StoredEvent>>;

    /// Next sequence to be written for the incident (0 when unknown).
    async fn head(&self, incident_id: &str) -> VigilResult<u64>;

    /// Global tail subscription, optionally replaying one incident first.
    fn subscribe(&self, replay: Option<ReplayFrom>) -> EventStream;
}
