//! Guardrail policy hook
//!
//! A guardrail reviews a proposed agent output and can veto it regardless of
//! the agent's confidence. Blocks are never retried.

use crate::agent::AgentRole;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a guardrail review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailVerdict {
    Pass,
    Block { reason: String },
}

impl GuardrailVerdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn block_reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::Block { reason } => Some(reason),
        }
    }
}

/// Policy check over a proposed agent output.
///
/// Implementations must be side-effect free: the same proposal always gets
/// the same verdict within one incident.
#[async_trait]
pub trait Guardrail: Send + Sync {
    async fn review(&self, role: AgentRole, proposal: &serde_json::Value) -> GuardrailVerdict;
}

/// Default guardrail: everything passes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Guardrail for AllowAll {
    async fn review(&self, _role: AgentRole, _proposal: &serde_json::Value) -> GuardrailVerdict {
        GuardrailVerdict::Pass
    }
}
