//! Remediation action execution
//!
//! The RESOLUTION agent proposes actions; approved ones run against external
//! resources through an `ActionExecutor`. Execution is retried under the
//! shared backoff policy; on final failure, previously succeeded actions are
//! rolled back best-effort using their rollback tokens.

use crate::error::VigilResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// An action proposed by the resolution agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ProposedAction {
    /// Extracts actions from a resolution proposal.
    ///
    /// Accepts `{"action": {...}}` or `{"actions": [...]}`. When the
    /// proposal carries no parseable action (including a failed resolution
    /// role whose peers still carried the vote), a single `noop` action keeps
    /// the audit trail uniform.
    pub fn from_proposal(proposal: &serde_json::Value) -> Vec<ProposedAction> {
        if let Some(one) = proposal.get("action") {
            if let Ok(action) = serde_json::from_value::<ProposedAction>(one.clone()) {
                return vec![action];
            }
        }
        if let Some(many) = proposal.get("actions").and_then(|v| v.as_array()) {
            let parsed: Vec<ProposedAction> = many
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect();
            if !parsed.is_empty() {
                return parsed;
            }
        }
        vec![ProposedAction {
            kind: "noop".into(),
            params: serde_json::Value::Null,
        }]
    }
}

/// Result of a successful execution
#[derive(Debug, Clone, Default)]
pub struct ActionReceipt {
    /// Token for undoing the action, when the target supports it
    pub rollback_token: Option<String>,
}

/// Runs approved remediation actions against external resources.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        incident_id: &str,
        action: &ProposedAction,
        cancel: &CancellationToken,
    ) -> VigilResult<ActionReceipt>;

    /// Best-effort undo; callers treat failure as non-fatal.
    async fn rollback(&self, incident_id: &str, rollback_token: &str) -> VigilResult<()>;
}

/// Default executor: records the action and reports success. Deployments
/// wire a real executor (cloud APIs, runbooks) in its place.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingActionExecutor;

#[async_trait]
impl ActionExecutor for LoggingActionExecutor {
    async fn execute(
        &self,
        incident_id: &str,
        action: &ProposedAction,
        _cancel: &CancellationToken,
    ) -> VigilResult<ActionReceipt> {
        tracing::info!(incident = %incident_id, kind = %action.kind, "executing remediation action");
        Ok(ActionReceipt::default())
    }

    async fn rollback(&self, incident_id: &str, rollback_token: &str) -> VigilResult<()> {
        tracing::info!(incident = %incident_id, token = %rollback_token, "rolling back action");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_action_shape() {
        let proposal = serde_json::json!({
            "action": {"kind": "scale_pool", "params": {"size": 50}}
        });
        let actions = ProposedAction::from_proposal(&proposal);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, "scale_pool");
        assert_eq!(actions[0].params["size"], 50);
    }

    #[test]
    fn action_list_shape() {
        let proposal = serde_json::json!({
            "actions": [
                {"kind": "restart_service"},
                {"kind": "notify", "params": {"channel": "ops"}}
            ]
        });
        let actions = ProposedAction::from_proposal(&proposal);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1].kind, "notify");
    }

    #[test]
    fn unparseable_proposal_yields_noop() {
        let actions = ProposedAction::from_proposal(&serde_json::json!({"summary": "text only"}));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, "noop");
    }
}
