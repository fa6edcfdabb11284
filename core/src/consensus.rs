//! Weighted Byzantine consensus over agent outputs
//!
//! Voting roles carry weight > 0 and must sum to 1. A role agrees when it
//! completed, passed its guardrail and reported confidence at or above the
//! agree threshold. Failed, cancelled or absent roles count as non-agreement
//! rather than blocking, so consensus survives up to f = (n-1)/3 silent
//! voters when the remaining weighted mass clears the threshold.

use crate::agent::{AgentOutput, AgentRole};
use crate::error::{VigilError, VigilResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance for weight-sum validation and score comparison.
pub const WEIGHT_EPSILON: f64 = 1e-9;

/// Consensus policy knobs
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Role weight in [0,1]; weight 0 marks an informational role
    pub weights: BTreeMap<AgentRole, f64>,
    /// Weighted score required for approval
    pub threshold: f64,
    /// Per-role confidence required to count as agree
    pub agree_threshold: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(AgentRole::Detection, 0.2);
        weights.insert(AgentRole::Diagnosis, 0.4);
        weights.insert(AgentRole::Prediction, 0.3);
        weights.insert(AgentRole::Resolution, 0.1);
        weights.insert(AgentRole::Communication, 0.0);
        Self {
            weights,
            threshold: 0.85,
            agree_threshold: 0.6,
        }
    }
}

impl ConsensusConfig {
    /// Checks weight ranges and that voting weights sum to 1.
    pub fn validate(&self) -> VigilResult<()> {
        let mut sum = 0.0;
        for (role, w) in &self.weights {
            if !(0.0..=1.0).contains(w) || w.is_nan() {
                return Err(VigilError::validation(format!(
                    "weight for {} must be in [0,1], got {}",
                    role, w
                )));
            }
            sum += w;
        }
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(VigilError::validation(format!(
                "voting weights must sum to 1.0, got {}",
                sum
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(VigilError::validation(format!(
                "consensus threshold must be in [0,1], got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.agree_threshold) {
            return Err(VigilError::validation(format!(
                "agree threshold must be in [0,1], got {}",
                self.agree_threshold
            )));
        }
        Ok(())
    }

    /// Roles with weight > 0.
    pub fn voting_roles(&self) -> impl Iterator<Item = (AgentRole, f64)> + '_ {
        self.weights
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .map(|(r, w)| (*r, *w))
    }

    /// Byzantine fault budget over the voting set: f = (n - 1) / 3.
    pub fn fault_budget(&self) -> usize {
        let n = self.voting_roles().count();
        n.saturating_sub(1) / 3
    }
}

/// One role's contribution to the decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub role: AgentRole,
    pub weight: f64,
    pub confidence: f64,
    pub agreed: bool,
}

/// Outcome of a consensus evaluation, with the per-role breakdown kept for
/// audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub weighted_score: f64,
    pub threshold: f64,
    pub approved: bool,
    pub votes: Vec<Vote>,
    /// Set when a resolution guardrail block forced rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Evaluates the weighted vote over the recorded outputs.
///
/// A RESOLUTION guardrail block forces `approved = false` even when the
/// numeric score clears the threshold; the block reason is recorded.
pub fn evaluate(
    config: &ConsensusConfig,
    outputs: &BTreeMap<AgentRole, AgentOutput>,
    decided_at: DateTime<Utc>,
) -> ConsensusResult {
    let mut votes = Vec::new();
    let mut score = 0.0;

    for (role, weight) in config.voting_roles() {
        let (confidence, agreed) = match outputs.get(&role) {
            Some(out) => {
                let agreed =
                    out.completed_and_passed() && out.confidence >= config.agree_threshold;
                (out.confidence, agreed)
            }
            // Silent voter: non-agreement, not a block
            None => (0.0, false),
        };
        if agreed {
            score += weight;
        }
        votes.push(Vote {
            role,
            weight,
            confidence,
            agreed,
        });
    }

    let block_reason = outputs
        .get(&AgentRole::Resolution)
        .and_then(|out| out.guardrail.block_reason())
        .map(str::to_owned);

    let numeric_approval = score + WEIGHT_EPSILON >= config.threshold;
    let approved = numeric_approval && block_reason.is_none();

    ConsensusResult {
        weighted_score: score,
        threshold: config.threshold,
        approved,
        votes,
        block_reason,
        decided_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::guardrail::GuardrailVerdict;

    fn completed(role: AgentRole, confidence: f64) -> AgentOutput {
        AgentOutput {
            role,
            status: AgentStatus::Completed,
            confidence,
            proposal: serde_json::json!({}),
            evidence: Vec::new(),
            guardrail: GuardrailVerdict::Pass,
            error: None,
            latency_ms: 100,
            tokens_in: 10,
            tokens_out: 10,
            cost_micros: 5,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-10-25T12:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn role_outputs(confidences: [f64; 4]) -> BTreeMap<AgentRole, AgentOutput> {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            AgentRole::Detection,
            completed(AgentRole::Detection, confidences[0]),
        );
        outputs.insert(
            AgentRole::Diagnosis,
            completed(AgentRole::Diagnosis, confidences[1]),
        );
        outputs.insert(
            AgentRole::Prediction,
            completed(AgentRole::Prediction, confidences[2]),
        );
        outputs.insert(
            AgentRole::Resolution,
            completed(AgentRole::Resolution, confidences[3]),
        );
        outputs.insert(
            AgentRole::Communication,
            completed(AgentRole::Communication, 0.5),
        );
        outputs
    }

    #[test]
    fn default_config_is_valid() {
        ConsensusConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_weight_sum_rejected() {
        let mut cfg = ConsensusConfig::default();
        cfg.weights.insert(AgentRole::Detection, 0.3);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fault_budget_for_four_voters() {
        assert_eq!(ConsensusConfig::default().fault_budget(), 1);
    }

    #[test]
    fn all_agree_scores_one() {
        let cfg = ConsensusConfig::default();
        let result = evaluate(&cfg, &role_outputs([0.93, 0.97, 0.73, 0.95]), now());
        assert!((result.weighted_score - 1.0).abs() < WEIGHT_EPSILON);
        assert!(result.approved);
        assert!(result.block_reason.is_none());
        // Informational role is excluded from the vote list arithmetic
        let comm = result
            .votes
            .iter()
            .find(|v| v.role == AgentRole::Communication);
        assert!(comm.is_none());
    }

    #[test]
    fn failed_prediction_drops_below_threshold() {
        let cfg = ConsensusConfig::default();
        let mut outputs = role_outputs([0.93, 0.97, 0.0, 0.95]);
        outputs.insert(
            AgentRole::Prediction,
            AgentOutput::failed(AgentRole::Prediction, "provider timeout"),
        );
        let result = evaluate(&cfg, &outputs, now());
        assert!((result.weighted_score - 0.70).abs() < WEIGHT_EPSILON);
        assert!(!result.approved);
    }

    #[test]
    fn guardrail_block_overrides_numeric_approval() {
        let cfg = ConsensusConfig::default();
        let mut outputs = role_outputs([1.0, 1.0, 1.0, 1.0]);
        if let Some(res) = outputs.get_mut(&AgentRole::Resolution) {
            res.guardrail = GuardrailVerdict::Block {
                reason: "action not permitted in region X".into(),
            };
        }
        let result = evaluate(&cfg, &outputs, now());
        // Resolution no longer agrees, so the numeric score is 0.9
        assert!((result.weighted_score - 0.9).abs() < WEIGHT_EPSILON);
        assert!(!result.approved);
        assert_eq!(
            result.block_reason.as_deref(),
            Some("action not permitted in region X")
        );
    }

    #[test]
    fn exact_threshold_is_reachable() {
        let mut cfg = ConsensusConfig::default();
        cfg.threshold = 0.9;
        // Detection + Diagnosis + Prediction agree: 0.2 + 0.4 + 0.3 = 0.9
        let mut outputs = role_outputs([0.95, 0.95, 0.95, 0.0]);
        outputs.insert(
            AgentRole::Resolution,
            completed(AgentRole::Resolution, 0.1), // below agree threshold
        );
        let result = evaluate(&cfg, &outputs, now());
        assert!((result.weighted_score - 0.9).abs() < WEIGHT_EPSILON);
        assert!(result.approved);
    }

    #[test]
    fn absent_voter_counts_as_non_agreement() {
        let cfg = ConsensusConfig::default();
        let mut outputs = role_outputs([0.95, 0.95, 0.95, 0.95]);
        outputs.remove(&AgentRole::Detection);
        let result = evaluate(&cfg, &outputs, now());
        assert!((result.weighted_score - 0.8).abs() < WEIGHT_EPSILON);
        assert!(!result.approved);
        let det = result
            .votes
            .iter()
            .find(|v| v.role == AgentRole::Detection)
            .unwrap();
        assert!(!det.agreed);
        assert_eq!(det.confidence, 0.0);
    }

    #[test]
    fn low_confidence_is_not_agreement() {
        let cfg = ConsensusConfig::default();
        let result = evaluate(&cfg, &role_outputs([0.59, 0.97, 0.73, 0.95]), now());
        // Detection at 0.59 sits below the 0.6 agree threshold
        assert!((result.weighted_score - 0.8).abs() < WEIGHT_EPSILON);
    }
}
