//! In-memory event store
//!
//! Process-local log keyed by incident id. Appends are atomic under a single
//! write lock; the live tail fans out over a broadcast channel so readers
//! never block writers.

use super::{EventStore, EventStream, ReplayFrom};
use crate::clock::SharedClock;
use crate::error::{VigilError, VigilResult};
use crate::event::{Event, StoredEvent};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const TAIL_CAPACITY: usize = 1024;
const REPLAY_CHUNK: usize = 256;

pub struct MemoryEventStore {
    clock: SharedClock,
    logs: RwLock<HashMap<String, Vec<StoredEvent>>>,
    tail: broadcast::Sender<StoredEvent>,
}

impl MemoryEventStore {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        let (tail, _) = broadcast::channel(TAIL_CAPACITY);
        Arc::new(Self {
            clock,
            logs: RwLock::new(HashMap::new()),
            tail,
        })
    }

    /// Total number of events across all incidents (monitoring / tests).
    pub fn len(&self) -> usize {
        self.logs.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Test hook: flip a byte in a stored payload to simulate corruption.
    #[cfg(test)]
    pub fn corrupt(&self, incident_id: &str, sequence: u64) {
        let mut logs = self.logs.write();
        if let Some(log) = logs.get_mut(incident_id) {
            if let Some(record) = log.get_mut(sequence as usize) {
                record.payload["__tampered"] = serde_json::json!(true);
            }
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        incident_id: &str,
        expected_sequence: u64,
        events: &[Event],
    ) -> VigilResult<u64> {
        if events.is_empty() {
            return Err(VigilError::validation("append of zero events"));
        }
        let now = self.clock.now();
        let mut logs = self.logs.write();
        let log = logs.entry(incident_id.to_string()).or_default();
        let head = log.len() as u64;
        if head != expected_sequence {
            return Err(VigilError::Conflict {
                incident_id: incident_id.to_string(),
                expected: expected_sequence,
                actual: head,
            });
        }
        let mut appended = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            let stored = StoredEvent::encode(incident_id, head + i as u64, now, event)?;
            appended.push(stored);
        }
        for stored in appended {
            log.push(stored.clone());
            // No receivers is fine; the tail is best-effort fan-out
            let _ = self.tail.send(stored);
        }
        Ok(log.len() as u64)
    }

    async fn read(
        &self,
        incident_id: &str,
        from_sequence: u64,
        limit: usize,
    ) -> VigilResult<Vec<StoredEvent>> {
        let logs = self.logs.read();
        let log = match logs.get(incident_id) {
            Some(log) => log,
            None => {
                return Err(VigilError::NotFound {
                    kind: "incident".into(),
                    id: incident_id.to_string(),
                })
            }
        };
        let start = (from_sequence as usize).min(log.len());
        let mut out = Vec::new();
        for record in log[start..].iter().take(limit) {
            record.verify()?;
            out.push(record.clone());
        }
        Ok(out)
    }

    async fn head(&self, incident_id: &str) -> VigilResult<u64> {
        Ok(self
            .logs
            .read()
            .get(incident_id)
            .map(|log| log.len() as u64)
            .unwrap_or(0))
    }

    fn subscribe(&self, replay: Option<ReplayFrom>) -> EventStream {
        let (tx, rx) = mpsc::channel(TAIL_CAPACITY);
        // Subscribe to the tail before snapshotting the replay range so the
        // seam is at-least-once rather than lossy.
        let mut tail = self.tail.subscribe();
        let replay_events: Vec<StoredEvent> = match &replay {
            Some(from) => {
                let logs = self.logs.read();
                logs.get(&from.incident_id)
                    .map(|log| {
                        let start = (from.from_sequence as usize).min(log.len());
                        log[start..].to_vec()
                    })
                    .unwrap_or_default()
            }
            None => Vec::new(),
        };

        tokio::spawn(async move {
            for chunk in replay_events.chunks(REPLAY_CHUNK) {
                for record in chunk {
                    if tx.send(record.clone()).await.is_err() {
                        return;
                    }
                }
            }
            loop {
                match tail.recv().await {
                    Ok(record) => {
                        if tx.send(record).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event tail subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        EventStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::incident::Phase;

    fn store() -> Arc<MemoryEventStore> {
        MemoryEventStore::new(Arc::new(ManualClock::default_start()))
    }

    fn phase_event(phase: Phase) -> Event {
        Event::PhaseEntered { phase }
    }

    #[tokio::test]
    async fn sequences_are_gap_free_from_zero() {
        let store = store();
        let head = store
            .append(
                "inc-1",
                0,
                &[phase_event(Phase::Detecting), phase_event(Phase::Diagnosing)],
            )
            .await
            .unwrap();
        assert_eq!(head, 2);
        let head = store
            .append("inc-1", 2, &[phase_event(Phase::Predicting)])
            .await
            .unwrap();
        assert_eq!(head, 3);

        let events = store.read("inc-1", 0, 100).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn stale_expected_sequence_conflicts() {
        let store = store();
        store
            .append("inc-1", 0, &[phase_event(Phase::Detecting)])
            .await
            .unwrap();
        let err = store
            .append("inc-1", 0, &[phase_event(Phase::Diagnosing)])
            .await
            .unwrap_err();
        match err {
            VigilError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_window_respects_from_and_limit() {
        let store = store();
        for i in 0..5u64 {
            store
                .append("inc-1", i, &[phase_event(Phase::Detecting)])
                .await
                .unwrap();
        }
        let events = store.read("inc-1", 2, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 2);
        assert_eq!(events[1].sequence, 3);
    }

    #[tokio::test]
    async fn unknown_incident_is_not_found() {
        let store = store();
        assert!(matches!(
            store.read("inc-404", 0, 10).await.unwrap_err(),
            VigilError::NotFound { .. }
        ));
        assert_eq!(store.head("inc-404").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corruption_is_detected_on_read() {
        let store = store();
        store
            .append("inc-1", 0, &[phase_event(Phase::Detecting)])
            .await
            .unwrap();
        store.corrupt("inc-1", 0);
        let err = store.read("inc-1", 0, 10).await.unwrap_err();
        assert!(matches!(err, VigilError::Corruption { sequence: 0, .. }));
    }

    #[tokio::test]
    async fn subscribe_replays_then_follows_tail() {
        let store = store();
        store
            .append("inc-1", 0, &[phase_event(Phase::Detecting)])
            .await
            .unwrap();

        let mut stream = store.subscribe(Some(ReplayFrom {
            incident_id: "inc-1".into(),
            from_sequence: 0,
        }));

        let replayed = stream.recv().await.unwrap();
        assert_eq!(replayed.sequence, 0);

        store
            .append("inc-1", 1, &[phase_event(Phase::Diagnosing)])
            .await
            .unwrap();
        let live = stream.recv().await.unwrap();
        assert_eq!(live.sequence, 1);
        assert_eq!(live.kind, "phase_entered");
    }

    #[tokio::test]
    async fn append_is_atomic_under_concurrency() {
        let store = store();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                // Optimistic retry loop: re-read the head on conflict
                loop {
                    let head = store.head("inc-1").await.unwrap();
                    match store
                        .append("inc-1", head, &[phase_event(Phase::Detecting)])
                        .await
                    {
                        Ok(_) => return,
                        Err(VigilError::Conflict { .. }) => continue,
                        Err(other) => panic!("unexpected {:?}", other),
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let events = store.read("inc-1", 0, 100).await.unwrap();
        assert_eq!(events.len(), 8);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.sequence, i as u64);
        }
    }
}
