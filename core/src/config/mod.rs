//! Configuration management
//!
//! One typed TOML tree loaded at startup. Every section has defaults that
//! match the documented behavior, so an empty file is a valid configuration
//! (minus providers, which have no sensible default credentials).

use crate::agent::AgentRole;
use crate::breaker::BreakerConfig;
use crate::bus::BusConfig;
use crate::consensus::ConsensusConfig;
use crate::error::{VigilError, VigilResult};
use crate::hub::{HubConfig, OverflowPolicy};
use crate::provider::CostPerToken;
use crate::rate_limiter::{RateLimitSettings, RateLimiterConfig};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// Root configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub server: ServerSection,
    pub workers: WorkersSection,
    pub incident: IncidentSection,
    pub consensus: ConsensusSection,
    pub agents: AgentsSection,
    pub breaker: BreakerSection,
    pub ratelimit: RateLimitSection,
    pub bus: BusSection,
    pub hub: HubSection,
    pub metrics: MetricsSection,
    /// Provider id -> transport settings
    pub providers: BTreeMap<String, ProviderSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub tls: Option<TlsSection>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9650".into(),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub max: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self { max: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentSection {
    /// Fingerprint-based alert coalescing window
    pub dedup_window_secs: u64,
    /// How long closed incidents stay queryable for late subscribers
    pub retention_secs: u64,
}

impl Default for IncidentSection {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300,
            retention_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub threshold: f64,
    pub agree_threshold: f64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            agree_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    /// Role -> consensus weight; must sum to 1 over voting roles
    pub weights: BTreeMap<String, f64>,
    /// Role -> per-run timeout in seconds
    pub timeouts_secs: BTreeMap<String, u64>,
    /// Role -> provider id
    pub providers: BTreeMap<String, String>,
    pub max_tokens: Option<u64>,
    pub max_cost_micros: Option<u64>,
}

impl Default for AgentsSection {
    fn default() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert("detection".into(), 0.2);
        weights.insert("diagnosis".into(), 0.4);
        weights.insert("prediction".into(), 0.3);
        weights.insert("resolution".into(), 0.1);
        weights.insert("communication".into(), 0.0);
        Self {
            weights,
            timeouts_secs: BTreeMap::new(),
            providers: BTreeMap::new(),
            max_tokens: None,
            max_cost_micros: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettingsSection {
    pub failure_threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for BreakerSettingsSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

impl BreakerSettingsSection {
    fn to_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            window: Duration::from_secs(self.window_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub default: BreakerSettingsSection,
    /// Dependency -> override
    pub overrides: BTreeMap<String, BreakerSettingsSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettingsSection {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitSettingsSection {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub idle_ttl_secs: u64,
    pub default: RateLimitSettingsSection,
    /// Provider id -> override
    pub providers: BTreeMap<String, RateLimitSettingsSection>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 600,
            default: RateLimitSettingsSection::default(),
            providers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    pub max_attempts: u32,
}

impl Default for BusSection {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub queue_depth: usize,
    pub batch_max_size: usize,
    pub batch_max_latency_ms: u64,
    pub overflow_policy: OverflowPolicy,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            batch_max_size: 10,
            batch_max_latency_ms: 100,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub publish_interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            publish_interval_secs: 30,
        }
    }
}

/// Transport backing a provider entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI-compatible HTTP endpoint
    #[default]
    Http,
    /// Canned responses; local development without credentials
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    /// Secret name resolved through the secret store, never the key itself
    pub api_key_secret: Option<String>,
    #[serde(default = "default_provider_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub pricing: PricingSection,
    pub monthly_budget_micros: Option<u64>,
    /// Response body served when `kind = "stub"`
    pub stub_body: Option<serde_json::Value>,
}

fn default_provider_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingSection {
    pub input_micros_per_1k: u64,
    pub output_micros_per_1k: u64,
}

impl VigilConfig {
    /// Loads and validates a TOML file.
    pub fn load(path: &Path) -> VigilResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VigilError::validation(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> VigilResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| VigilError::validation(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VigilResult<()> {
        self.consensus_config()?.validate()?;
        if self.workers.max == 0 {
            return Err(VigilError::validation("workers.max must be at least 1"));
        }
        if self.hub.queue_depth == 0 || self.hub.batch_max_size == 0 {
            return Err(VigilError::validation(
                "hub.queue_depth and hub.batch_max_size must be at least 1",
            ));
        }
        if self.bus.max_attempts == 0 {
            return Err(VigilError::validation("bus.max_attempts must be at least 1"));
        }
        for (role, provider) in &self.agents.providers {
            role_from_key(role)?;
            if !self.providers.contains_key(provider) {
                return Err(VigilError::validation(format!(
                    "agents.providers.{} references unknown provider {}",
                    role, provider
                )));
            }
        }
        for (provider_id, section) in &self.providers {
            if section.kind == ProviderKind::Http
                && (section.base_url.is_empty() || section.model.is_empty())
            {
                return Err(VigilError::validation(format!(
                    "provider {} requires base_url and model",
                    provider_id
                )));
            }
        }
        for role in self
            .agents
            .weights
            .keys()
            .chain(self.agents.timeouts_secs.keys())
        {
            role_from_key(role)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conversions into component configs
    // ------------------------------------------------------------------

    pub fn consensus_config(&self) -> VigilResult<ConsensusConfig> {
        let mut weights = BTreeMap::new();
        for (key, weight) in &self.agents.weights {
            weights.insert(role_from_key(key)?, *weight);
        }
        Ok(ConsensusConfig {
            weights,
            threshold: self.consensus.threshold,
            agree_threshold: self.consensus.agree_threshold,
        })
    }

    pub fn runner_timeouts(&self) -> VigilResult<HashMap<AgentRole, Duration>> {
        let mut out = HashMap::new();
        for (key, secs) in &self.agents.timeouts_secs {
            out.insert(role_from_key(key)?, Duration::from_secs(*secs));
        }
        Ok(out)
    }

    pub fn runner_providers(&self) -> VigilResult<HashMap<AgentRole, String>> {
        let mut out = HashMap::new();
        for (key, provider) in &self.agents.providers {
            out.insert(role_from_key(key)?, provider.clone());
        }
        Ok(out)
    }

    pub fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            default: RateLimitSettings {
                capacity: self.ratelimit.default.capacity,
                refill_per_sec: self.ratelimit.default.refill_per_sec,
            },
            per_key: self
                .ratelimit
                .providers
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        RateLimitSettings {
                            capacity: v.capacity,
                            refill_per_sec: v.refill_per_sec,
                        },
                    )
                })
                .collect(),
            idle_ttl: Duration::from_secs(self.ratelimit.idle_ttl_secs),
        }
    }

    pub fn breaker_default(&self) -> BreakerConfig {
        self.breaker.default.to_config()
    }

    pub fn breaker_overrides(&self) -> HashMap<String, BreakerConfig> {
        self.breaker
            .overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.to_config()))
            .collect()
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            max_attempts: self.bus.max_attempts,
            retry: RetryPolicy::default(),
            rng_seed: None,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_depth: self.hub.queue_depth,
            batch_max_size: self.hub.batch_max_size,
            batch_max_latency: Duration::from_millis(self.hub.batch_max_latency_ms),
            overflow_policy: self.hub.overflow_policy,
        }
    }

    pub fn pricing_for(&self, provider: &str) -> CostPerToken {
        self.providers
            .get(provider)
            .map(|p| CostPerToken {
                input_micros_per_1k: p.pricing.input_micros_per_1k,
                output_micros_per_1k: p.pricing.output_micros_per_1k,
            })
            .unwrap_or_default()
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.incident.dedup_window_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.incident.retention_secs as i64)
    }
}

/// Maps a config key like `detection` onto its role.
pub fn role_from_key(key: &str) -> VigilResult<AgentRole> {
    match key.to_ascii_lowercase().as_str() {
        "detection" => Ok(AgentRole::Detection),
        "diagnosis" => Ok(AgentRole::Diagnosis),
        "prediction" => Ok(AgentRole::Prediction),
        "resolution" => Ok(AgentRole::Resolution),
        "communication" => Ok(AgentRole::Communication),
        other => Err(VigilError::validation(format!(
            "unknown agent role in config: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config = VigilConfig::from_toml_str("").unwrap();
        assert_eq!(config.workers.max, 8);
        assert_eq!(config.incident.dedup_window_secs, 300);
        assert_eq!(config.consensus.threshold, 0.85);
        assert_eq!(config.hub.queue_depth, 256);
        assert_eq!(config.bus.max_attempts, 5);
        let consensus = config.consensus_config().unwrap();
        consensus.validate().unwrap();
    }

    #[test]
    fn full_config_round_trips() {
        let raw = r#"
[server]
bind = "0.0.0.0:9650"

[workers]
max = 4

[incident]
dedup_window_secs = 120

[consensus]
threshold = 0.9

[agents.weights]
detection = 0.25
diagnosis = 0.25
prediction = 0.25
resolution = 0.25
communication = 0.0

[agents.timeouts_secs]
diagnosis = 45

[agents.providers]
detection = "openai"

[breaker.overrides.openai]
failure_threshold = 3
window_secs = 30
cooldown_secs = 10

[ratelimit.providers.openai]
capacity = 20.0
refill_per_sec = 10.0

[hub]
queue_depth = 64
overflow_policy = "disconnect"

[providers.openai]
base_url = "https://api.openai.com/v1"
model = "gpt-4o"
api_key_secret = "OPENAI_API_KEY"

[providers.openai.pricing]
input_micros_per_1k = 2500
output_micros_per_1k = 10000
"#;
        let config = VigilConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.workers.max, 4);
        assert_eq!(
            config.runner_timeouts().unwrap()[&AgentRole::Diagnosis],
            Duration::from_secs(45)
        );
        assert_eq!(
            config.runner_providers().unwrap()[&AgentRole::Detection],
            "openai"
        );
        assert_eq!(
            config.breaker_overrides()["openai"].failure_threshold,
            3
        );
        assert_eq!(config.limiter_config().per_key["openai"].capacity, 20.0);
        assert_eq!(config.hub_config().overflow_policy, OverflowPolicy::Disconnect);
        assert_eq!(config.pricing_for("openai").input_micros_per_1k, 2500);
    }

    #[test]
    fn bad_weight_sum_fails_validation() {
        let raw = r#"
[agents.weights]
detection = 0.5
diagnosis = 0.2
"#;
        assert!(VigilConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn unknown_role_fails_validation() {
        let raw = r#"
[agents.timeouts_secs]
wizardry = 10
"#;
        assert!(VigilConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn stub_providers_need_no_endpoint() {
        let raw = r#"
[providers.local]
kind = "stub"

[providers.local.stub_body]
confidence = 0.8
"#;
        let config = VigilConfig::from_toml_str(raw).unwrap();
        let section = &config.providers["local"];
        assert_eq!(section.kind, ProviderKind::Stub);
        assert_eq!(section.stub_body.as_ref().unwrap()["confidence"], 0.8);
    }

    #[test]
    fn http_providers_require_endpoint_and_model() {
        let raw = r#"
[providers.openai]
model = "gpt-4o"
"#;
        assert!(VigilConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn provider_reference_must_exist() {
        let raw = r#"
[agents.providers]
detection = "ghost"
"#;
        assert!(VigilConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "[workers]\nmax = 2\n").unwrap();
        let config = VigilConfig::load(&path).unwrap();
        assert_eq!(config.workers.max, 2);
        assert!(VigilConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
