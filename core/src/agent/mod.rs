//! Agent roles and outputs
//!
//! A fleet of role-specialized agents analyzes each incident. Roles are a
//! closed set; polymorphism lives at the provider boundary, not here.

pub mod runner;

pub use runner::{AgentBudget, AgentRunner, RunnerConfig};

use crate::guardrail::GuardrailVerdict;
use serde::{Deserialize, Serialize};

/// Pipeline role an agent fills for one incident.
///
/// Declaration order is pipeline order; `Ord` relies on it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRole {
    /// Confirms the alert describes a real problem and classifies it
    Detection,
    /// Finds the likely root cause
    Diagnosis,
    /// Projects impact if no action is taken
    Prediction,
    /// Proposes the remediation action and votes on it
    Resolution,
    /// Drafts stakeholder communication
    Communication,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        Self::Detection,
        Self::Diagnosis,
        Self::Prediction,
        Self::Resolution,
        Self::Communication,
    ];

    /// Roles run sequentially before consensus, each feeding the next.
    pub const SEQUENTIAL: [AgentRole; 3] = [Self::Detection, Self::Diagnosis, Self::Prediction];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Diagnosis => "diagnosis",
            Self::Prediction => "prediction",
            Self::Resolution => "resolution",
            Self::Communication => "communication",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of one agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Retrieval evidence backing an agent's proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub source_id: String,
    /// Similarity score in [0,1]
    pub similarity: f64,
    pub excerpt: String,
}

/// Result of one agent run against an incident snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub role: AgentRole,
    pub status: AgentStatus,
    /// Confidence in [0,1]; FAILED and CANCELLED force 0
    pub confidence: f64,
    /// Role-specific structured payload
    pub proposal: serde_json::Value,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
    pub guardrail: GuardrailVerdict,
    /// Failure reason when status is FAILED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_micros: u64,
}

impl AgentOutput {
    /// Output for a run that never produced a usable result.
    pub fn failed(role: AgentRole, reason: impl Into<String>) -> Self {
        Self {
            role,
            status: AgentStatus::Failed,
            confidence: 0.0,
            proposal: serde_json::Value::Null,
            evidence: Vec::new(),
            guardrail: GuardrailVerdict::Pass,
            error: Some(reason.into()),
            latency_ms: 0,
            tokens_in: 0,
            tokens_out: 0,
            cost_micros: 0,
        }
    }

    /// Output for a run aborted by cancellation.
    pub fn cancelled(role: AgentRole) -> Self {
        Self {
            status: AgentStatus::Cancelled,
            error: None,
            ..Self::failed(role, "")
        }
    }

    /// Whether this output can count as an agreement vote.
    pub fn completed_and_passed(&self) -> bool {
        self.status == AgentStatus::Completed && matches!(self.guardrail, GuardrailVerdict::Pass)
    }
}

/// Clamp a raw confidence value into the [0,1] contract.
pub fn clamp_confidence(raw: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    raw.clamp(0.0, 1.0)
}
