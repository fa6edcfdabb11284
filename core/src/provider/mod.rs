//! Provider facade
//!
//! Uniform contract over external AI model providers. The facade is payload-
//! agnostic: it selects a transport for the provider id, translates transport
//! failures into the typed taxonomy, meters usage and cost, and enforces
//! monthly spend caps. Every call emits a `provider.call` bus event.

pub mod http;
pub mod stub;

pub use http::HttpProviderTransport;
pub use stub::StubProviderTransport;

use crate::bus::{MessageBus, Priority};
use crate::clock::SharedClock;
use crate::error::{VigilError, VigilResult};
use async_trait::async_trait;
use chrono::Datelike;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Opaque request to a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub body: serde_json::Value,
}

/// Opaque response from a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub body: serde_json::Value,
}

/// Structured usage counters for one call
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub latency_ms: u64,
    pub cost_micros: u64,
}

/// Token pricing in microdollars per 1000 tokens
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostPerToken {
    pub input_micros_per_1k: u64,
    pub output_micros_per_1k: u64,
}

impl CostPerToken {
    pub fn cost_micros(&self, tokens_in: u64, tokens_out: u64) -> u64 {
        (tokens_in * self.input_micros_per_1k + tokens_out * self.output_micros_per_1k) / 1000
    }
}

/// A pluggable provider backend.
///
/// Implementations return structured usage counters or `None` when the
/// backend does not report them.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn invoke(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> VigilResult<(ProviderResponse, Option<ProviderUsage>)>;
}

struct MonthlySpend {
    /// (year, month) the counter belongs to
    month: (i32, u32),
    spent_micros: u64,
}

struct ProviderEntry {
    transport: Arc<dyn ProviderTransport>,
    pricing: CostPerToken,
    monthly_cap_micros: Option<u64>,
    spend: Mutex<MonthlySpend>,
}

/// Rolling per-provider totals for monitoring
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderSpendSnapshot {
    pub provider: String,
    pub month_spent_micros: u64,
    pub monthly_cap_micros: Option<u64>,
}

/// Single entry point for all external model calls.
pub struct ProviderFacade {
    clock: SharedClock,
    bus: MessageBus,
    providers: RwLock<HashMap<String, Arc<ProviderEntry>>>,
}

impl ProviderFacade {
    pub fn new(clock: SharedClock, bus: MessageBus) -> Self {
        Self {
            clock,
            bus,
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a transport under a provider id. Later registrations
    /// replace earlier ones.
    pub fn register(
        &self,
        provider_id: impl Into<String>,
        transport: Arc<dyn ProviderTransport>,
        pricing: CostPerToken,
        monthly_cap_micros: Option<u64>,
    ) {
        let now = self.clock.now();
        let entry = ProviderEntry {
            transport,
            pricing,
            monthly_cap_micros,
            spend: Mutex::new(MonthlySpend {
                month: (now.year(), now.month()),
                spent_micros: 0,
            }),
        };
        self.providers
            .write()
            .insert(provider_id.into(), Arc::new(entry));
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    pub fn spend_snapshots(&self) -> Vec<ProviderSpendSnapshot> {
        let now = self.clock.now();
        let month = (now.year(), now.month());
        self.providers
            .read()
            .iter()
            .map(|(id, entry)| {
                let spend = entry.spend.lock();
                ProviderSpendSnapshot {
                    provider: id.clone(),
                    month_spent_micros: if spend.month == month {
                        spend.spent_micros
                    } else {
                        0
                    },
                    monthly_cap_micros: entry.monthly_cap_micros,
                }
            })
            .collect()
    }

    /// Invokes a provider and meters the call.
    pub async fn invoke(
        &self,
        provider_id: &str,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> VigilResult<(ProviderResponse, ProviderUsage)> {
        let entry = self
            .providers
            .read()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| VigilError::NotFound {
                kind: "provider".into(),
                id: provider_id.to_string(),
            })?;

        self.check_budget(provider_id, &entry)?;

        let started = self.clock.now();
        let result = entry.transport.invoke(request, cancel).await;
        let latency_ms = (self.clock.now() - started).num_milliseconds().max(0) as u64;

        match result {
            Ok((response, usage)) => {
                let mut usage = usage.unwrap_or_default();
                usage.latency_ms = latency_ms;
                usage.cost_micros = entry.pricing.cost_micros(usage.tokens_in, usage.tokens_out);
                self.add_spend(&entry, usage.cost_micros);
                self.emit_call(provider_id, &usage, "ok", None);
                Ok((response, usage))
            }
            Err(err) => {
                let usage = ProviderUsage {
                    latency_ms,
                    ..ProviderUsage::default()
                };
                self.emit_call(provider_id, &usage, "error", Some(err.category()));
                Err(err)
            }
        }
    }

    fn check_budget(&self, provider_id: &str, entry: &ProviderEntry) -> VigilResult<()> {
        let Some(cap) = entry.monthly_cap_micros else {
            return Ok(());
        };
        let now = self.clock.now();
        let month = (now.year(), now.month());
        let mut spend = entry.spend.lock();
        if spend.month != month {
            spend.month = month;
            spend.spent_micros = 0;
        }
        if spend.spent_micros >= cap {
            return Err(VigilError::BudgetExceeded {
                provider: provider_id.to_string(),
                spent_micros: spend.spent_micros,
                cap_micros: cap,
            });
        }
        Ok(())
    }

    fn add_spend(&self, entry: &ProviderEntry, cost_micros: u64) {
        let now = self.clock.now();
        let month = (now.year(), now.month());
        let mut spend = entry.spend.lock();
        if spend.month != month {
            spend.month = month;
            spend.spent_micros = 0;
        }
        spend.spent_micros += cost_micros;
    }

    fn emit_call(
        &self,
        provider_id: &str,
        usage: &ProviderUsage,
        outcome: &str,
        error_category: Option<&str>,
    ) {
        self.bus.publish_json(
            "provider.call",
            Priority::Low,
            serde_json::json!({
                "provider": provider_id,
                "outcome": outcome,
                "error_category": error_category,
                "latency_ms": usage.latency_ms,
                "tokens_in": usage.tokens_in,
                "tokens_out": usage.tokens_out,
                "cost_micros": usage.cost_micros,
            }),
        );
    }
}
