//! Incident events
//!
//! Events are the integration currency of the kernel: every state transition
//! is recorded as an immutable event, persisted with a content hash, and
//! replayable in per-incident sequence order.

use crate::agent::{AgentOutput, AgentRole};
use crate::consensus::ConsensusResult;
use crate::error::{VigilError, VigilResult};
use crate::incident::{Alert, ExecutedAction, Phase, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One state transition in an incident's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    IncidentOpened {
        severity: Severity,
        fingerprint: String,
        alert: Alert,
    },
    /// A deduplicated alert joined an already-open incident
    AlertAttached { alert: Alert },
    PhaseEntered { phase: Phase },
    AgentStarted { role: AgentRole },
    AgentCompleted { output: AgentOutput },
    ConsensusReached { result: ConsensusResult },
    ActionStarted { action: ExecutedAction },
    ActionFinished { action: ExecutedAction },
    IncidentResolved {
        resolved_at: DateTime<Utc>,
        duration_ms: u64,
    },
    IncidentFailed { reason: String },
    IncidentRejected,
    IncidentCancelled,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IncidentOpened { .. } => "incident_opened",
            Self::AlertAttached { .. } => "alert_attached",
            Self::PhaseEntered { .. } => "phase_entered",
            Self::AgentStarted { .. } => "agent_started",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::ConsensusReached { .. } => "consensus_reached",
            Self::ActionStarted { .. } => "action_started",
            Self::ActionFinished { .. } => "action_finished",
            Self::IncidentResolved { .. } => "incident_resolved",
            Self::IncidentFailed { .. } => "incident_failed",
            Self::IncidentRejected => "incident_rejected",
            Self::IncidentCancelled => "incident_cancelled",
        }
    }
}

/// Persisted event record.
///
/// `content_hash` covers `kind` plus the canonical payload bytes so replay
/// can detect corruption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub incident_id: String,
    /// Per-incident monotonic sequence starting at 0, gap-free
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    /// Event fields without the kind tag
    pub payload: serde_json::Value,
    pub content_hash: String,
}

impl StoredEvent {
    /// Builds the persisted form of an event.
    pub fn encode(
        incident_id: &str,
        sequence: u64,
        timestamp: DateTime<Utc>,
        event: &Event,
    ) -> VigilResult<Self> {
        let kind = event.kind().to_string();
        let mut value = serde_json::to_value(event)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("kind");
        }
        let content_hash = content_hash(&kind, &value)?;
        Ok(Self {
            incident_id: incident_id.to_string(),
            sequence,
            timestamp,
            kind,
            payload: value,
            content_hash,
        })
    }

    /// Recomputes the hash and reconstructs the event.
    ///
    /// Returns `Corruption` on hash mismatch or an undecodable payload.
    pub fn decode(&self) -> VigilResult<Event> {
        self.verify()?;
        let mut value = self.payload.clone();
        match value.as_object_mut() {
            Some(map) => {
                map.insert("kind".into(), serde_json::Value::String(self.kind.clone()));
            }
            None => {
                return Err(self.corruption());
            }
        }
        serde_json::from_value(value).map_err(|_| self.corruption())
    }

    /// Hash check only, for paths that stream records without decoding.
    pub fn verify(&self) -> VigilResult<()> {
        let expected = content_hash(&self.kind, &self.payload)?;
        if expected != self.content_hash {
            return Err(self.corruption());
        }
        Ok(())
    }

    fn corruption(&self) -> VigilError {
        VigilError::Corruption {
            incident_id: self.incident_id.clone(),
            sequence: self.sequence,
        }
    }
}

/// SHA-256 over kind + canonical payload JSON. serde_json emits object keys
/// in sorted order, so the bytes are stable for a given value.
pub fn content_hash(kind: &str, payload: &serde_json::Value) -> VigilResult<String> {
    let bytes = serde_json::to_vec(payload)?;
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-10-25T12:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sample_event() -> Event {
        Event::PhaseEntered {
            phase: Phase::Detecting,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let event = sample_event();
        let stored = StoredEvent::encode("inc-1", 3, now(), &event).unwrap();
        assert_eq!(stored.kind, "phase_entered");
        assert_eq!(stored.sequence, 3);
        assert_eq!(stored.decode().unwrap(), event);
    }

    #[test]
    fn payload_does_not_duplicate_kind() {
        let stored = StoredEvent::encode("inc-1", 0, now(), &sample_event()).unwrap();
        assert!(stored.payload.get("kind").is_none());
    }

    #[test]
    fn tampered_payload_is_corruption() {
        let mut stored = StoredEvent::encode("inc-1", 0, now(), &sample_event()).unwrap();
        stored.payload["phase"] = serde_json::json!({"state": "RESOLVING"});
        let err = stored.decode().unwrap_err();
        assert!(matches!(
            err,
            VigilError::Corruption {
                sequence: 0,
                ..
            }
        ));
    }

    #[test]
    fn tampered_kind_is_corruption() {
        let mut stored = StoredEvent::encode("inc-1", 5, now(), &sample_event()).unwrap();
        stored.kind = "incident_resolved".into();
        assert!(stored.verify().is_err());
    }

    #[test]
    fn hash_is_stable_across_encodes() {
        let a = StoredEvent::encode("inc-1", 0, now(), &sample_event()).unwrap();
        let b = StoredEvent::encode("inc-1", 0, now(), &sample_event()).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn unit_variant_events_encode() {
        let stored = StoredEvent::encode("inc-1", 9, now(), &Event::IncidentRejected).unwrap();
        assert_eq!(stored.kind, "incident_rejected");
        assert_eq!(stored.decode().unwrap(), Event::IncidentRejected);
    }
}
