//! API surface
//!
//! The process-boundary facade over the kernel: alert ingress, incident
//! queries, cancellation, streaming subscriptions, metrics and health. The
//! wire server is a thin frame pump over this type; all composition of the
//! kernel's parts happens in `from_config`.

use crate::agent::{AgentBudget, AgentRunner, RunnerConfig};
use crate::breaker::{BreakerRegistry, BreakerSnapshot, BreakerState};
use crate::bus::MessageBus;
use crate::clock::{Clock, SharedClock, SharedIdGen, SystemClock, UuidIdGen};
use crate::config::{ProviderKind, VigilConfig};
use crate::error::{VigilError, VigilResult};
use crate::event::StoredEvent;
use crate::guardrail::Guardrail;
use crate::hub::{SubscriberFilter, SubscriberHub};
use crate::incident::{Alert, Incident};
use crate::metrics::{MetricsService, MetricsSnapshot};
use crate::orchestrator::{ActionExecutor, Orchestrator, OrchestratorConfig, SubmitAck};
use crate::provider::{
    HttpProviderTransport, ProviderFacade, ProviderSpendSnapshot, StubProviderTransport,
};
use crate::provider::http::HttpProviderConfig;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::secrets::SecretStore;
use crate::store::MemoryEventStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Liveness plus per-dependency readiness
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_secs: i64,
    pub incidents_in_memory: usize,
    pub subscribers: usize,
    pub breakers: Vec<BreakerSnapshot>,
    pub providers: Vec<ProviderSpendSnapshot>,
}

/// Everything external callers can reach.
#[derive(Clone)]
pub struct VigilApi {
    orchestrator: Orchestrator,
    hub: SubscriberHub,
    metrics: Arc<MetricsService>,
    breakers: Arc<BreakerRegistry>,
    facade: Arc<ProviderFacade>,
    bus: MessageBus,
    clock: SharedClock,
    started_at: DateTime<Utc>,
}

impl VigilApi {
    /// Assembles a kernel from preconstructed parts (tests, embedders).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestrator: Orchestrator,
        hub: SubscriberHub,
        metrics: Arc<MetricsService>,
        breakers: Arc<BreakerRegistry>,
        facade: Arc<ProviderFacade>,
        bus: MessageBus,
        clock: SharedClock,
    ) -> Self {
        let started_at = clock.now();
        Self {
            orchestrator,
            hub,
            metrics,
            breakers,
            facade,
            bus,
            clock,
            started_at,
        }
    }

    /// Production wiring: system clock, uuid ids, in-memory store, HTTP
    /// providers resolved through the secret store.
    pub fn from_config(
        config: &VigilConfig,
        secrets: &dyn SecretStore,
        guardrail: Arc<dyn Guardrail>,
        executor: Arc<dyn ActionExecutor>,
    ) -> VigilResult<Self> {
        let clock: SharedClock = Arc::new(SystemClock);
        let ids: SharedIdGen = Arc::new(UuidIdGen);

        let bus = MessageBus::new(config.bus_config(), clock.clone());
        let hub = SubscriberHub::new(config.hub_config(), clock.clone());
        let store: Arc<MemoryEventStore> = MemoryEventStore::new(clock.clone());

        let facade = Arc::new(ProviderFacade::new(clock.clone(), bus.clone()));
        for (provider_id, section) in &config.providers {
            let transport: Arc<dyn crate::provider::ProviderTransport> = match section.kind {
                ProviderKind::Http => {
                    let api_key = match &section.api_key_secret {
                        Some(name) => Some(secrets.get(name)?),
                        None => None,
                    };
                    Arc::new(HttpProviderTransport::new(HttpProviderConfig {
                        base_url: section.base_url.clone(),
                        model: section.model.clone(),
                        api_key,
                        request_timeout: Duration::from_secs(section.request_timeout_secs),
                    })?)
                }
                ProviderKind::Stub => Arc::new(
                    section
                        .stub_body
                        .clone()
                        .map(StubProviderTransport::new)
                        .unwrap_or_default(),
                ),
            };
            facade.register(
                provider_id.clone(),
                transport,
                config.pricing_for(provider_id),
                section.monthly_budget_micros,
            );
        }

        let limiter = Arc::new(RateLimiter::new(config.limiter_config()));
        let breakers = Arc::new(BreakerRegistry::new(
            clock.clone(),
            config.breaker_default(),
            config.breaker_overrides(),
        ));
        let runner = Arc::new(AgentRunner::new(
            RunnerConfig {
                provider_by_role: config.runner_providers()?,
                timeout_by_role: config.runner_timeouts()?,
                default_timeout: Duration::from_secs(30),
                retry: RetryPolicy::agent(),
                rng_seed: None,
            },
            facade.clone(),
            limiter,
            breakers.clone(),
            guardrail,
            clock.clone(),
        ));

        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                dedup_window: config.dedup_window(),
                retention: config.retention(),
                workers: config.workers.max,
                consensus: config.consensus_config()?,
                budget: AgentBudget {
                    max_tokens: config.agents.max_tokens,
                    max_cost_micros: config.agents.max_cost_micros,
                },
                action_retry: RetryPolicy::default(),
                rng_seed: None,
            },
            clock.clone(),
            ids,
            store,
            bus.clone(),
            hub.clone(),
            runner,
            executor,
        );

        let metrics = MetricsService::new(clock.clone(), hub.clone(), bus.clone());
        metrics.attach();
        metrics.start_publishing(
            Duration::from_secs(config.metrics.publish_interval_secs),
            CancellationToken::new(),
        );

        Ok(Self::new(
            orchestrator,
            hub,
            metrics,
            breakers,
            facade,
            bus,
            clock,
        ))
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub async fn submit_alert(&self, alert: Alert) -> VigilResult<SubmitAck> {
        self.orchestrator.submit_alert(alert).await
    }

    pub fn get_incident(&self, incident_id: &str) -> VigilResult<Incident> {
        self.orchestrator.get_incident(incident_id)
    }

    pub async fn cancel_incident(&self, incident_id: &str) -> VigilResult<()> {
        self.orchestrator.cancel_incident(incident_id).await
    }

    /// Opens a streaming subscription; events arrive in batches, in per-
    /// incident sequence order.
    pub fn stream_incidents(
        &self,
        filter: SubscriberFilter,
    ) -> (u64, mpsc::Receiver<Vec<StoredEvent>>) {
        self.hub.subscribe(filter)
    }

    pub fn unsubscribe(&self, subscription_id: u64) {
        self.hub.unsubscribe(subscription_id);
    }

    pub fn heartbeat(&self, subscription_id: u64) {
        let _ = self.hub.heartbeat(subscription_id);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> HealthReport {
        let breakers = self.breakers.snapshots();
        let degraded = breakers.iter().any(|b| b.state != BreakerState::Closed);
        HealthReport {
            status: if degraded { "degraded" } else { "ok" },
            uptime_secs: (self.clock.now() - self.started_at).num_seconds(),
            incidents_in_memory: self.orchestrator.incident_count(),
            subscribers: self.hub.stats().subscribers,
            breakers,
            providers: self.facade.spend_snapshots(),
        }
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
        self.hub.shutdown();
        self.bus.shutdown();
    }

    /// Unary dispatch for the wire server: `method` + JSON params in, JSON
    /// result out.
    pub async fn handle_call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> VigilResult<serde_json::Value> {
        match method {
            "submit_alert" => {
                let alert = alert_from_params(&*self.clock, params)?;
                let ack = self.submit_alert(alert).await?;
                Ok(serde_json::to_value(ack)?)
            }
            "get_incident" => {
                let id = required_str(&params, "id")?;
                let incident = self.get_incident(&id)?;
                Ok(serde_json::to_value(incident)?)
            }
            "cancel_incident" => {
                let id = required_str(&params, "id")?;
                self.cancel_incident(&id).await?;
                Ok(serde_json::json!({"cancelled": true}))
            }
            "get_metrics" => Ok(serde_json::to_value(self.metrics())?),
            "health" => Ok(serde_json::to_value(self.health())?),
            other => Err(VigilError::validation(format!("unknown method: {}", other))),
        }
    }
}

fn required_str(params: &serde_json::Value, field: &str) -> VigilResult<String> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| VigilError::validation(format!("missing field: {}", field)))
}

fn alert_from_params(clock: &dyn Clock, params: serde_json::Value) -> VigilResult<Alert> {
    let source = required_str(&params, "source")?;
    let payload = params
        .get("payload")
        .cloned()
        .ok_or_else(|| VigilError::validation("missing field: payload"))?;
    let received_at = match params.get("received_at").and_then(|v| v.as_str()) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| VigilError::validation(format!("bad received_at: {}", e)))?
            .with_timezone(&Utc),
        None => clock.now(),
    };
    let signature = params
        .get("signature")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Ok(Alert {
        source,
        received_at,
        payload,
        signature,
    })
}
