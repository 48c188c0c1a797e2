//! Orchestrator configuration.
//!
//! Loaded once at startup from a TOML file; hot reload is not supported.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (`ORCH_BIND`, `ORCH_CONSENSUS_K`,
//!    `ORCH_FAILURE_THRESHOLD`, `ORCH_COOLDOWN_SECS`)
//! 2. Values in the file
//! 3. Built-in defaults
//!
//! ```toml
//! bind = "0.0.0.0:8088"
//!
//! [[providers]]
//! id = "openai"
//! kind = "openai_compatible"
//! model = "gpt-4o-mini"
//! credential_env = "OPENAI_API_KEY"
//! capabilities = ["general", "code"]
//! trust_weight = 0.9
//!
//! [routing]
//! default_order = ["openai", "local"]
//!
//! [routing.categories]
//! sales = ["openai"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapter::retry::RetryPolicy;
use crate::errors::ConfigError;
use crate::registry::{CostClass, ProviderKind};

const DEFAULT_BIND: &str = "127.0.0.1:8088";
/// Per-call provider timeout when a provider does not set its own.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
/// Outbound concurrency cap per provider.
pub const DEFAULT_MAX_CONCURRENT: usize = 50;
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_WINDOW_SECS: u64 = 300;
const DEFAULT_CONSENSUS_K: usize = 3;
const DEFAULT_CONSENSUS_GRACE_MS: u64 = 2_000;
const DEFAULT_SESSION_IDLE_SECS: u64 = 30 * 60;
const DEFAULT_HISTORY_TURNS: usize = 10;
const DEFAULT_MAX_STORED_TURNS: usize = 100;
const DEFAULT_MAX_MESSAGE_CHARS: usize = 8_000;

const ENV_BIND: &str = "ORCH_BIND";
const ENV_CONSENSUS_K: &str = "ORCH_CONSENSUS_K";
const ENV_FAILURE_THRESHOLD: &str = "ORCH_FAILURE_THRESHOLD";
const ENV_COOLDOWN_SECS: &str = "ORCH_COOLDOWN_SECS";

/// One configured AI backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name used in routing lists and responses.
    pub id: String,
    /// Wire protocol spoken by the backend.
    pub kind: ProviderKind,
    /// Base URL; defaults to the public endpoint for `kind`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model name sent with each request.
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_trust_weight")]
    pub trust_weight: f64,
    #[serde(default)]
    pub cost_class: CostClass,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Per-provider circuit breaker overrides.
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

fn default_trust_weight() -> f64 {
    1.0
}

impl ProviderConfig {
    /// Minimal provider entry; remaining fields take their defaults.
    pub fn new(id: impl Into<String>, kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            base_url: None,
            model: model.into(),
            credential_env: None,
            capabilities: Vec::new(),
            trust_weight: default_trust_weight(),
            cost_class: CostClass::default(),
            max_concurrent: None,
            timeout_secs: None,
            max_tokens: None,
            failure_threshold: None,
            cooldown_secs: None,
        }
    }

    pub fn with_trust_weight(mut self, weight: f64) -> Self {
        self.trust_weight = weight;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Provider ordering per task category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Global priority order; empty means the order of `[[providers]]`.
    pub default_order: Vec<String>,
    /// Category name → provider priority list.
    pub categories: BTreeMap<String, Vec<String>>,
}

/// Circuit breaker tuning shared by every provider unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    /// Length of the rolling success/failure window.
    pub window_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Maximum providers queried in parallel.
    pub k: usize,
    /// Added to the slowest selected provider timeout to form the global deadline.
    pub grace_ms: u64,
    /// Fixed global deadline, replacing the timeout-plus-grace rule when set.
    pub timeout_ms: Option<u64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_CONSENSUS_K,
            grace_ms: DEFAULT_CONSENSUS_GRACE_MS,
            timeout_ms: None,
        }
    }
}

impl ConsensusConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Global fan-out deadline given the slowest selected provider timeout.
    pub fn deadline_for(&self, slowest_timeout: Duration) -> Duration {
        match self.timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => slowest_timeout + self.grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    /// Prior turns replayed to the provider as conversation context.
    pub history_turns: usize,
    /// Turns kept per session; older turns are dropped. Never below
    /// `history_turns`.
    pub max_stored_turns: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_SESSION_IDLE_SECS,
            history_turns: DEFAULT_HISTORY_TURNS,
            max_stored_turns: DEFAULT_MAX_STORED_TURNS,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stored_turns(&self) -> usize {
        self.max_stored_turns.max(self.history_turns).max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_message_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Listen address for the HTTP front end.
    pub bind: String,
    pub providers: Vec<ProviderConfig>,
    pub routing: RoutingConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub consensus: ConsensusConfig,
    pub sessions: SessionConfig,
    pub limits: LimitsConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            providers: Vec::new(),
            routing: RoutingConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            consensus: ConsensusConfig::default(),
            sessions: SessionConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Read, parse, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind = bind;
        }
        if let Some(raw) = lookup(ENV_CONSENSUS_K) {
            self.consensus.k = parse_setting("consensus.k", &raw)?;
        }
        if let Some(raw) = lookup(ENV_FAILURE_THRESHOLD) {
            self.breaker.failure_threshold = parse_setting("breaker.failure_threshold", &raw)?;
        }
        if let Some(raw) = lookup(ENV_COOLDOWN_SECS) {
            self.breaker.cooldown_secs = parse_setting("breaker.cooldown_secs", &raw)?;
        }
        Ok(())
    }

    /// Check global settings. Provider entries are validated by the registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.consensus.k == 0 {
            return Err(invalid("consensus.k", "must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier", "must be >= 1.0"));
        }
        if self.limits.max_message_chars == 0 {
            return Err(invalid("limits.max_message_chars", "must be at least 1"));
        }
        Ok(())
    }
}

fn parse_setting<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| invalid(field, &e.to_string()))
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        field,
        reason: reason.to_string(),
    }
}
