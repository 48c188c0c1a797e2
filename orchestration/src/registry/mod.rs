//! Provider Registry: configured backends and their routing order
//!
//! Built once at startup from [`OrchestratorConfig`]. Descriptors are
//! immutable; live health lives in the
//! [`HealthMonitor`](crate::router::circuit_breaker::HealthMonitor).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{OrchestratorConfig, ProviderConfig, DEFAULT_MAX_CONCURRENT, DEFAULT_TIMEOUT_SECS};
use crate::errors::ConfigError;
use crate::router::task_classifier::TaskCategory;

/// Wire protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// OpenAI-style `/chat/completions` (hosted or self-hosted vLLM/llama.cpp).
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    /// Anthropic Messages API.
    #[serde(rename = "anthropic")]
    Anthropic,
    /// Local Ollama server.
    #[serde(rename = "ollama")]
    Ollama,
}

impl ProviderKind {
    /// Endpoint used when the configuration omits `base_url`.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAiCompatible => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Ollama => "http://localhost:11434",
        }
    }

    /// Whether the backend runs on local hardware.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAiCompatible => write!(f, "openai_compatible"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

/// Relative price of a call, used for operator visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Low,
    #[default]
    Medium,
    High,
}

/// Name of the environment variable that holds a provider's API key.
///
/// The secret itself is owned by whatever populates the environment; only
/// the reference is kept here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(var: impl Into<String>) -> Self {
        Self(var.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Look the secret up at call time.
    pub fn resolve(&self) -> Option<String> {
        std::env::var(&self.0).ok().filter(|v| !v.is_empty())
    }
}

/// Immutable description of one configured backend.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub credential: Option<CredentialRef>,
    pub capabilities: BTreeSet<String>,
    /// Consensus scoring bias in [0, 1].
    pub trust_weight: f64,
    pub cost_class: CostClass,
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub max_tokens: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub cooldown: Option<Duration>,
}

impl ProviderDescriptor {
    fn from_config(cfg: &ProviderConfig) -> Result<Self, ConfigError> {
        let id = cfg.id.trim().to_string();
        if id.is_empty() {
            return Err(ConfigError::EmptyProviderId);
        }
        if !(0.0..=1.0).contains(&cfg.trust_weight) {
            return Err(ConfigError::TrustWeightOutOfRange {
                id,
                weight: cfg.trust_weight,
            });
        }
        let timeout_secs = cfg.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout { id });
        }

        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| cfg.kind.default_base_url().to_string());
        let valid_url = reqwest::Url::parse(&base_url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !valid_url {
            return Err(ConfigError::InvalidEndpoint {
                id,
                endpoint: base_url,
            });
        }

        Ok(Self {
            kind: cfg.kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            credential: cfg.credential_env.as_deref().map(CredentialRef::new),
            capabilities: cfg.capabilities.iter().cloned().collect(),
            trust_weight: cfg.trust_weight,
            cost_class: cfg.cost_class,
            max_concurrent: cfg.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT).max(1),
            timeout: Duration::from_secs(timeout_secs),
            max_tokens: cfg.max_tokens,
            failure_threshold: cfg.failure_threshold,
            cooldown: cfg.cooldown_secs.map(Duration::from_secs),
            id,
        })
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.contains(tag)
    }
}

/// Catalog of configured providers with per-category priority lists.
#[derive(Debug)]
pub struct ProviderRegistry {
    /// Configuration order.
    providers: Vec<Arc<ProviderDescriptor>>,
    index: HashMap<String, usize>,
    default_order: Vec<usize>,
    categories: HashMap<TaskCategory, Vec<usize>>,
}

impl ProviderRegistry {
    /// Build the registry, failing fast on any malformed entry.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, ConfigError> {
        if config.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut providers = Vec::with_capacity(config.providers.len());
        let mut index = HashMap::new();
        for cfg in &config.providers {
            let descriptor = ProviderDescriptor::from_config(cfg)?;
            if index.contains_key(&descriptor.id) {
                return Err(ConfigError::DuplicateProvider(descriptor.id));
            }
            index.insert(descriptor.id.clone(), providers.len());
            providers.push(Arc::new(descriptor));
        }

        let resolve = |list: &str, ids: &[String]| -> Result<Vec<usize>, ConfigError> {
            let mut seen = HashSet::new();
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let pos = *index
                    .get(id.trim())
                    .ok_or_else(|| ConfigError::UnknownRoutedProvider {
                        list: list.to_string(),
                        provider: id.clone(),
                    })?;
                if seen.insert(pos) {
                    out.push(pos);
                }
            }
            Ok(out)
        };

        let default_order = if config.routing.default_order.is_empty() {
            (0..providers.len()).collect()
        } else {
            resolve("default_order", &config.routing.default_order)?
        };

        let mut categories = HashMap::new();
        for (name, ids) in &config.routing.categories {
            let category: TaskCategory = name
                .parse()
                .map_err(|_| ConfigError::UnknownCategory(name.clone()))?;
            let order = resolve(name, ids)?;
            if !order.is_empty() {
                categories.insert(category, order);
            }
        }

        Ok(Self {
            providers,
            index,
            default_order,
            categories,
        })
    }

    /// Every configured provider in configuration order.
    pub fn list_providers(&self) -> &[Arc<ProviderDescriptor>] {
        &self.providers
    }

    /// Providers for `category` in priority order, falling back to the
    /// global default order when the category has no list of its own.
    pub fn by_category(&self, category: TaskCategory) -> Vec<Arc<ProviderDescriptor>> {
        self.categories
            .get(&category)
            .unwrap_or(&self.default_order)
            .iter()
            .map(|&i| self.providers[i].clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ProviderDescriptor>> {
        self.index.get(id).map(|&i| &self.providers[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Position in configuration order, used for deterministic tie-breaks.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
