//! Agent runner
//!
//! Invokes a single role against an incident snapshot: rate-limit token,
//! circuit breaker, provider call with timeout, guardrail review, retries on
//! retryable provider errors. Never panics the pipeline: every failure mode
//! comes back as an `AgentOutput` with FAILED or CANCELLED status.

use crate::agent::{clamp_confidence, AgentOutput, AgentRole, AgentStatus, EvidenceRef};
use crate::breaker::BreakerRegistry;
use crate::clock::SharedClock;
use crate::error::VigilError;
use crate::guardrail::{Guardrail, GuardrailVerdict};
use crate::incident::Incident;
use crate::provider::{ProviderFacade, ProviderRequest, ProviderUsage};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Spend limits for one agent run
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentBudget {
    pub max_tokens: Option<u64>,
    pub max_cost_micros: Option<u64>,
}

impl AgentBudget {
    fn exceeded_by(&self, usage: &ProviderUsage) -> bool {
        let tokens = usage.tokens_in + usage.tokens_out;
        self.max_tokens.is_some_and(|cap| tokens > cap)
            || self.max_cost_micros.is_some_and(|cap| usage.cost_micros > cap)
    }
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Provider backing each role
    pub provider_by_role: HashMap<AgentRole, String>,
    pub timeout_by_role: HashMap<AgentRole, Duration>,
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
    /// Fixed jitter seed for tests; None seeds from entropy
    pub rng_seed: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            provider_by_role: HashMap::new(),
            timeout_by_role: HashMap::new(),
            default_timeout: Duration::from_secs(30),
            retry: RetryPolicy::agent(),
            rng_seed: None,
        }
    }
}

/// Drives one agent run end to end.
pub struct AgentRunner {
    config: RunnerConfig,
    facade: Arc<ProviderFacade>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<BreakerRegistry>,
    guardrail: Arc<dyn Guardrail>,
    clock: SharedClock,
    rng: Mutex<StdRng>,
}

impl AgentRunner {
    pub fn new(
        config: RunnerConfig,
        facade: Arc<ProviderFacade>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<BreakerRegistry>,
        guardrail: Arc<dyn Guardrail>,
        clock: SharedClock,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            facade,
            limiter,
            breakers,
            guardrail,
            clock,
            rng: Mutex::new(rng),
        }
    }

    pub fn timeout_for(&self, role: AgentRole) -> Duration {
        self.config
            .timeout_by_role
            .get(&role)
            .copied()
            .unwrap_or(self.config.default_timeout)
    }

    /// Runs `role` against the incident snapshot.
    pub async fn run(
        &self,
        incident: &Incident,
        role: AgentRole,
        budget: AgentBudget,
        cancel: &CancellationToken,
    ) -> AgentOutput {
        let started = self.clock.now();
        let finish = |mut output: AgentOutput, clock: &SharedClock| {
            output.latency_ms = (clock.now() - started).num_milliseconds().max(0) as u64;
            output
        };

        let Some(provider_id) = self.config.provider_by_role.get(&role).cloned() else {
            return finish(
                AgentOutput::failed(role, format!("no provider configured for role {}", role)),
                &self.clock,
            );
        };

        if let Err(err) = self.limiter.acquire(&provider_id, 1, cancel).await {
            return finish(
                match err {
                    VigilError::Cancelled => AgentOutput::cancelled(role),
                    other => AgentOutput::failed(role, other.to_string()),
                },
                &self.clock,
            );
        }

        let request = ProviderRequest {
            body: build_request_body(incident, role),
        };
        let timeout = self.timeout_for(role);
        let breaker = self.breakers.breaker(&provider_id);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let call = breaker.call(|| async {
                tokio::select! {
                    res = tokio::time::timeout(
                        timeout,
                        self.facade.invoke(&provider_id, &request, cancel),
                    ) => match res {
                        Ok(inner) => inner,
                        Err(_) => Err(VigilError::Timeout {
                            operation: format!("agent {} via {}", role, provider_id),
                            elapsed: timeout,
                        }),
                    },
                    _ = cancel.cancelled() => Err(VigilError::Cancelled),
                }
            });

            match call.await {
                Ok((response, usage)) => {
                    if budget.exceeded_by(&usage) {
                        return finish(
                            AgentOutput::failed(
                                role,
                                format!(
                                    "run budget exceeded: {} tokens, {} microdollars",
                                    usage.tokens_in + usage.tokens_out,
                                    usage.cost_micros
                                ),
                            ),
                            &self.clock,
                        );
                    }
                    let output = self.assemble(role, response.body, &usage).await;
                    return finish(output, &self.clock);
                }
                Err(VigilError::Cancelled) => {
                    return finish(AgentOutput::cancelled(role), &self.clock);
                }
                Err(err) if err.is_retryable() && self.config.retry.allows_retry(attempts) => {
                    let delay = {
                        let mut rng = self.rng.lock();
                        self.config.retry.delay_for_attempt(attempts, &mut *rng)
                    };
                    tracing::debug!(
                        role = %role,
                        provider = %provider_id,
                        attempt = attempts,
                        error = %err,
                        "retryable agent failure, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return finish(AgentOutput::cancelled(role), &self.clock);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(role = %role, provider = %provider_id, error = %err, "agent run failed");
                    return finish(AgentOutput::failed(role, err.to_string()), &self.clock);
                }
            }
        }
    }

    /// Turns a raw provider response into an output, applying the guardrail.
    async fn assemble(
        &self,
        role: AgentRole,
        body: serde_json::Value,
        usage: &ProviderUsage,
    ) -> AgentOutput {
        let confidence = clamp_confidence(
            body.get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
        );
        let proposal = body.get("proposal").cloned().unwrap_or_else(|| body.clone());
        let evidence = parse_evidence(&body);

        let verdict = self.guardrail.review(role, &proposal).await;
        let (status, confidence, error) = match &verdict {
            GuardrailVerdict::Pass => (AgentStatus::Completed, confidence, None),
            GuardrailVerdict::Block { reason } => {
                tracing::warn!(role = %role, reason = %reason, "guardrail blocked agent output");
                (AgentStatus::Failed, 0.0, Some(reason.clone()))
            }
        };

        AgentOutput {
            role,
            status,
            confidence,
            proposal,
            evidence,
            guardrail: verdict,
            error,
            latency_ms: usage.latency_ms,
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_micros: usage.cost_micros,
        }
    }
}

/// Builds the role-specific request: the incident snapshot plus every prior
/// proposal, so each phase feeds the next.
fn build_request_body(incident: &Incident, role: AgentRole) -> serde_json::Value {
    let prior: serde_json::Map<String, serde_json::Value> = incident
        .agent_outputs
        .iter()
        .filter(|(r, _)| **r < role)
        .map(|(r, out)| {
            (
                r.name().to_string(),
                serde_json::json!({
                    "confidence": out.confidence,
                    "proposal": out.proposal,
                }),
            )
        })
        .collect();

    serde_json::json!({
        "role": role,
        "incident": {
            "id": incident.id,
            "severity": incident.severity,
            "phase": incident.phase,
            "alerts": incident.alerts,
        },
        "prior": prior,
    })
}

fn parse_evidence(body: &serde_json::Value) -> Vec<EvidenceRef> {
    body.get("evidence")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
