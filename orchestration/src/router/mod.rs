//! Router Module
//!
//! Turns a task category into an ordered chain of providers to try:
//!
//! ```text
//! session override (if available) ─┐
//! by_category(category) ───────────┼─ filter is_available ─ dedupe ─▶ ProviderChain
//!                                  │
//! nothing available ───────────────┴─ least-recently-failed provider (last resort)
//! ```
//!
//! The chain is never empty. An Open provider only appears when every
//! provider is Open, and then alone. Routing never claims a half-open trial
//! permit; the adapter does that when it actually calls the provider.

pub mod circuit_breaker;
pub mod prompts;
pub mod task_classifier;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

pub use circuit_breaker::{CircuitState, HealthMonitor, HealthSnapshot};
pub use prompts::system_prompt;
pub use task_classifier::{Classification, ClassificationSource, TaskCategory, TaskClassifier};

use crate::registry::ProviderRegistry;

/// Ordered, non-empty list of provider ids to try for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderChain {
    ids: Vec<String>,
    /// Set when no provider was available and the chain holds the
    /// least-recently-failed provider instead.
    pub last_resort: bool,
}

impl ProviderChain {
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn head(&self) -> &str {
        &self.ids[0]
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

/// Routing over the registry, filtered by live health.
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthMonitor>,
}

impl Router {
    pub fn new(registry: Arc<ProviderRegistry>, health: Arc<HealthMonitor>) -> Self {
        Self { registry, health }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Build the provider chain for `category`.
    pub fn route(&self, category: TaskCategory, session_override: Option<&str>) -> ProviderChain {
        self.route_limited(category, session_override, usize::MAX)
    }

    /// Like [`route`](Self::route) but stops after `limit` available
    /// providers.
    pub fn route_limited(
        &self,
        category: TaskCategory,
        session_override: Option<&str>,
        limit: usize,
    ) -> ProviderChain {
        let limit = limit.max(1);
        let mut ids: Vec<String> = Vec::new();

        if let Some(preferred) = session_override {
            if !self.registry.contains(preferred) {
                warn!(provider = preferred, "override names unknown provider, ignoring");
            } else if self.health.is_available(preferred) {
                ids.push(preferred.to_string());
            } else {
                warn!(provider = preferred, "override provider unavailable, ignoring");
            }
        }

        for provider in self.registry.by_category(category) {
            if ids.len() >= limit {
                break;
            }
            if ids.iter().any(|id| *id == provider.id) {
                continue;
            }
            if self.health.is_available(&provider.id) {
                ids.push(provider.id.clone());
            } else {
                debug!(provider = %provider.id, %category, "skipping unavailable provider");
            }
        }

        if !ids.is_empty() {
            debug!(%category, chain = ?ids, "routed");
            return ProviderChain {
                ids,
                last_resort: false,
            };
        }

        let fallback = self
            .health
            .least_recently_failed(self.registry.ids())
            .or_else(|| self.registry.ids().next().map(str::to_string));
        match fallback {
            Some(id) => {
                warn!(%category, provider = %id, "no provider available, using last resort");
                ProviderChain {
                    ids: vec![id],
                    last_resort: true,
                }
            }
            // The registry rejects empty configurations, so this is unreachable
            // for a router built from a validated registry.
            None => ProviderChain {
                ids: Vec::new(),
                last_resort: true,
            },
        }
    }
}
