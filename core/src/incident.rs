//! Incident aggregate
//!
//! The root aggregate of the kernel. The orchestrator exclusively owns
//! incidents; everything else sees immutable snapshots. Every mutation bumps
//! `version` and goes through the phase machine's legal transitions.

use crate::agent::{AgentOutput, AgentRole};
use crate::consensus::ConsensusResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Alert severity levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Reads an optional `severity` field out of an alert payload.
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        match payload.get("severity").and_then(|v| v.as_str()) {
            Some(s) => match s.to_ascii_uppercase().as_str() {
                "LOW" => Self::Low,
                "HIGH" => Self::High,
                "CRITICAL" => Self::Critical,
                _ => Self::Medium,
            },
            None => Self::Medium,
        }
    }
}

/// Terminal outcome of a closed incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseOutcome {
    Resolved,
    Rejected,
    Failed,
    Cancelled,
}

/// Incident pipeline phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Open,
    Detecting,
    Diagnosing,
    Predicting,
    Consensus,
    Resolving,
    Communicating,
    AwaitingHuman,
    Closed(CloseOutcome),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// Legal edges of the state machine. Any non-terminal phase may jump to
    /// CLOSED(failed) or CLOSED(cancelled).
    pub fn can_transition_to(&self, to: Phase) -> bool {
        use Phase::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Closed(CloseOutcome::Failed) | Closed(CloseOutcome::Cancelled)) {
            return true;
        }
        matches!(
            (self, to),
            (Open, Detecting)
                | (Detecting, Diagnosing)
                | (Diagnosing, Predicting)
                | (Predicting, Consensus)
                | (Consensus, Resolving)
                | (Consensus, AwaitingHuman)
                | (Resolving, Communicating)
                | (Communicating, Closed(CloseOutcome::Resolved))
                | (AwaitingHuman, Closed(CloseOutcome::Rejected))
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Detecting => "DETECTING",
            Self::Diagnosing => "DIAGNOSING",
            Self::Predicting => "PREDICTING",
            Self::Consensus => "CONSENSUS",
            Self::Resolving => "RESOLVING",
            Self::Communicating => "COMMUNICATING",
            Self::AwaitingHuman => "AWAITING_HUMAN",
            Self::Closed(CloseOutcome::Resolved) => "CLOSED_RESOLVED",
            Self::Closed(CloseOutcome::Rejected) => "CLOSED_REJECTED",
            Self::Closed(CloseOutcome::Failed) => "CLOSED_FAILED",
            Self::Closed(CloseOutcome::Cancelled) => "CLOSED_CANCELLED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A monitoring alert. Immutable after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub source: String,
    pub received_at: DateTime<Utc>,
    /// Opaque structured payload from the monitoring source
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Alert {
    /// Deterministic dedup fingerprint: SHA-256 over the canonical payload
    /// bytes. serde_json sorts object keys, so equal payloads hash equal.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// Outcome of an executed remediation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionOutcome {
    Pending,
    Succeeded,
    Failed,
    RolledBack,
}

/// One remediation action run against an external resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub id: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: ActionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The root aggregate: one correlated operational problem tracked from alert
/// to resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub severity: Severity,
    pub fingerprint: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub alerts: Vec<Alert>,
    /// Latest output per role; history lives in the event store
    pub agent_outputs: BTreeMap<AgentRole, AgentOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusResult>,
    pub actions: Vec<ExecutedAction>,
    /// Optimistic concurrency counter; increments on every mutation
    pub version: u64,
}

impl Incident {
    pub fn open(id: String, alert: Alert, now: DateTime<Utc>) -> Self {
        let fingerprint = alert.fingerprint();
        let severity = Severity::from_payload(&alert.payload);
        Self {
            id,
            severity,
            fingerprint,
            phase: Phase::Open,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            alerts: vec![alert],
            agent_outputs: BTreeMap::new(),
            consensus: None,
            actions: Vec::new(),
            version: 0,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        // updated_at never goes backwards even if the clock does
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Attaches a deduplicated alert to the open incident.
    pub fn attach_alert(&mut self, alert: Alert, now: DateTime<Utc>) {
        let severity = Severity::from_payload(&alert.payload);
        if severity > self.severity {
            self.severity = severity;
        }
        self.alerts.push(alert);
        self.touch(now);
    }

    /// Records the latest output for a role. Ignored once the incident is
    /// closed: late agent results must not mutate a settled aggregate.
    pub fn record_output(&mut self, output: AgentOutput, now: DateTime<Utc>) {
        if self.phase.is_terminal() {
            tracing::debug!(
                incident = %self.id,
                role = %output.role,
                "dropping agent output for closed incident"
            );
            return;
        }
        self.agent_outputs.insert(output.role, output);
        self.touch(now);
    }

    pub fn record_consensus(&mut self, result: ConsensusResult, now: DateTime<Utc>) {
        self.consensus = Some(result);
        self.touch(now);
    }

    pub fn record_action(&mut self, action: ExecutedAction, now: DateTime<Utc>) {
        match self.actions.iter_mut().find(|a| a.id == action.id) {
            Some(existing) => *existing = action,
            None => self.actions.push(action),
        }
        self.touch(now);
    }

    /// Moves the phase along a declared edge.
    pub fn transition(&mut self, to: Phase, now: DateTime<Utc>) -> crate::VigilResult<()> {
        if !self.phase.can_transition_to(to) {
            return Err(crate::VigilError::internal(format!(
                "illegal phase transition {} -> {} for incident {}",
                self.phase, to, self.id
            )));
        }
        self.phase = to;
        if to == Phase::Closed(CloseOutcome::Resolved) {
            self.resolved_at = Some(now);
        }
        self.touch(now);
        Ok(())
    }

    /// Time to resolution, defined only for resolved incidents.
    pub fn time_to_resolve(&self) -> Option<chrono::Duration> {
        self.resolved_at.map(|r| r - self.created_at)
    }
}
