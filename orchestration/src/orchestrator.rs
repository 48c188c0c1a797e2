//! Orchestrator: one entry point for every request
//!
//! ```text
//! answer(request)
//!   ├─ validate message              (the only caller-visible error)
//!   ├─ session: override + history
//!   ├─ classify → system prompt
//!   ├─ consensus? ─ yes ─▶ ConsensusAggregator
//!   │              no  ─▶ route → try chain in order, first success wins
//!   ├─ nothing answered → synthetic Unavailable response
//!   └─ append turn to session
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::adapter::{
    http::build_client, Admission, BackendRequest, HttpBackend, ProviderAdapter, ProviderBackend,
};
use crate::config::{LimitsConfig, OrchestratorConfig};
use crate::ensemble::ConsensusAggregator;
use crate::errors::{BackendError, ConfigError, OrchestrationError, OrchestrationResult};
use crate::registry::{ProviderDescriptor, ProviderRegistry};
use crate::resilience::{DegradationLevel, Response};
use crate::request::Request;
use crate::router::{
    system_prompt, HealthMonitor, HealthSnapshot, Router, TaskCategory, TaskClassifier,
};
use crate::session::{SessionContext, SessionStore, SessionTurn};

/// Multi-provider request orchestrator.
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthMonitor>,
    router: Router,
    classifier: TaskClassifier,
    adapters: Arc<HashMap<String, Arc<ProviderAdapter>>>,
    consensus: ConsensusAggregator,
    sessions: SessionStore,
    limits: LimitsConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.registry.ids().collect::<Vec<_>>())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Orchestrator {
    /// Build with an HTTP backend per configured provider.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ProviderRegistry::from_config(config)?;
        let client = build_client()?;
        let backends = registry
            .list_providers()
            .iter()
            .map(|p| {
                let backend: Arc<dyn ProviderBackend> =
                    Arc::new(HttpBackend::new(client.clone(), p.clone()));
                (p.id.clone(), backend)
            })
            .collect();
        Self::assemble(config, registry, backends)
    }

    /// Build with caller-supplied backends, one per configured provider id.
    pub fn with_backends(
        config: &OrchestratorConfig,
        backends: HashMap<String, Arc<dyn ProviderBackend>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ProviderRegistry::from_config(config)?;
        Self::assemble(config, registry, backends)
    }

    fn assemble(
        config: &OrchestratorConfig,
        registry: ProviderRegistry,
        mut backends: HashMap<String, Arc<dyn ProviderBackend>>,
    ) -> Result<Self, ConfigError> {
        let registry = Arc::new(registry);
        let health = Arc::new(HealthMonitor::new(&registry, &config.breaker));

        let mut adapters = HashMap::with_capacity(registry.len());
        for descriptor in registry.list_providers() {
            let backend = backends
                .remove(&descriptor.id)
                .ok_or_else(|| ConfigError::MissingBackend(descriptor.id.clone()))?;
            let adapter = ProviderAdapter::new(
                descriptor.clone(),
                backend,
                health.clone(),
                config.retry.clone(),
            );
            adapters.insert(descriptor.id.clone(), Arc::new(adapter));
        }
        let adapters = Arc::new(adapters);

        let router = Router::new(registry.clone(), health.clone());
        let consensus =
            ConsensusAggregator::new(router.clone(), adapters.clone(), config.consensus.clone());

        info!(
            providers = registry.len(),
            consensus_k = config.consensus.k,
            failure_threshold = config.breaker.failure_threshold,
            "orchestrator ready"
        );

        Ok(Self {
            registry,
            health,
            router,
            classifier: TaskClassifier::new(),
            adapters,
            consensus,
            sessions: SessionStore::new(&config.sessions),
            limits: config.limits.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn providers(&self) -> &[Arc<ProviderDescriptor>] {
        self.registry.list_providers()
    }

    pub fn health_snapshot(&self) -> Vec<HealthSnapshot> {
        self.health.snapshot()
    }

    /// Answer one request.
    ///
    /// Provider failures never surface here: when nothing answers the
    /// result is the synthetic Unavailable response. Only a malformed
    /// request is an error.
    pub async fn answer(&self, request: Request) -> OrchestrationResult<Response> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "orchestrate",
            %request_id,
            session = request.session().unwrap_or("-"),
            consensus = request.consensus
        );
        self.answer_inner(request).instrument(span).await
    }

    async fn answer_inner(&self, request: Request) -> OrchestrationResult<Response> {
        self.validate(&request)?;
        let started = Instant::now();
        let session_id = request.session().map(str::to_string);

        let provider_override = request.provider_override.as_deref().and_then(|id| {
            if self.registry.contains(id) {
                Some(id)
            } else {
                warn!(provider = id, "unknown provider override ignored");
                None
            }
        });
        let context = match session_id.as_deref() {
            Some(id) => self.sessions.prepare(id, provider_override),
            None => SessionContext {
                provider_override: provider_override.map(str::to_string),
                history: Vec::new(),
            },
        };

        let classification = self
            .classifier
            .classify_detailed(&request.message, request.context_hint.as_deref());
        let category = classification.category;
        info!(%category, source = ?classification.source, "classified");

        let backend_request = Arc::new(BackendRequest {
            system_prompt: system_prompt(category).to_string(),
            history: context.history,
            message: request.message.clone(),
        });
        let preferred = context.provider_override.as_deref();

        let response = if request.consensus {
            self.consensus_answer(category, preferred, backend_request, started)
                .await
        } else {
            self.failover_answer(category, preferred, &backend_request, started)
                .await
        };

        if let Some(id) = session_id.as_deref() {
            self.sessions.append(
                id,
                SessionTurn {
                    message: request.message,
                    category,
                    provider_used: response.provider_id.clone(),
                    response_text: response.text.clone(),
                    at: response.timestamp,
                },
            );
        }

        info!(
            provider = %response.provider_id,
            degradation = %response.degradation,
            latency_ms = response.latency_ms(),
            "request answered"
        );
        Ok(response)
    }

    fn validate(&self, request: &Request) -> OrchestrationResult<()> {
        if request.message.trim().is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }
        let max = self.limits.max_message_chars;
        if request.message.chars().count() > max {
            return Err(OrchestrationError::InvalidRequest(format!(
                "message exceeds {max} characters"
            )));
        }
        Ok(())
    }

    /// Sequential failover along the routed chain.
    async fn failover_answer(
        &self,
        category: TaskCategory,
        preferred: Option<&str>,
        request: &BackendRequest,
        started: Instant,
    ) -> Response {
        let chain = self.router.route(category, preferred);
        let admission = Admission::for_chain(chain.last_resort);
        let mut warnings = Vec::new();

        for id in chain.iter() {
            let Some(adapter) = self.adapters.get(id) else {
                continue;
            };
            match adapter.invoke(request, admission, None).await {
                Ok(reply) => {
                    let mut response =
                        Response::from_provider(reply, category, started.elapsed(), warnings);
                    if chain.last_resort {
                        response.degradation = DegradationLevel::Partial;
                    }
                    return response;
                }
                Err(err) if matches!(err.cause, BackendError::CircuitOpen) => {
                    debug!(provider = %err.provider, "trial permit already taken, trying next");
                }
                Err(err) => {
                    warn!(
                        provider = %err.provider,
                        attempts = err.attempts,
                        error = %err.cause,
                        "provider failed, trying next"
                    );
                    warnings.push(err.to_string());
                }
            }
        }

        warn!(
            %category,
            tried = chain.len(),
            "all providers failed, returning unavailable response"
        );
        Response::unavailable(category, started.elapsed(), warnings)
    }

    async fn consensus_answer(
        &self,
        category: TaskCategory,
        preferred: Option<&str>,
        request: Arc<BackendRequest>,
        started: Instant,
    ) -> Response {
        let outcome = self.consensus.run(category, preferred, request).await;
        match outcome.vote {
            Some(vote) => {
                let mut response = Response::from_provider(
                    vote.winner.response,
                    category,
                    started.elapsed(),
                    outcome.failures,
                );
                if outcome.last_resort {
                    response.degradation = DegradationLevel::Partial;
                }
                response
            }
            None => {
                warn!(
                    %category,
                    participants = ?outcome.participants,
                    "no consensus participant answered, returning unavailable response"
                );
                Response::unavailable(category, started.elapsed(), outcome.failures)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScriptedBackend;
    use crate::config::ProviderConfig;
    use crate::registry::ProviderKind;

    fn config(ids: &[&str]) -> OrchestratorConfig {
        OrchestratorConfig {
            providers: ids
                .iter()
                .map(|id| ProviderConfig::new(*id, ProviderKind::OpenAiCompatible, "m"))
                .collect(),
            ..Default::default()
        }
    }

    fn orchestrator(ids: &[&str]) -> Orchestrator {
        let backends = ids
            .iter()
            .map(|id| {
                let backend: Arc<dyn ProviderBackend> =
                    Arc::new(ScriptedBackend::replying(&format!("from {id}")));
                (id.to_string(), backend)
            })
            .collect();
        Orchestrator::with_backends(&config(ids), backends).unwrap()
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let orch = orchestrator(&["a"]);
        let err = orch.answer(Request::new("   ")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let mut cfg = config(&["a"]);
        cfg.limits.max_message_chars = 10;
        let backend: Arc<dyn ProviderBackend> = Arc::new(ScriptedBackend::replying("x"));
        let orch =
            Orchestrator::with_backends(&cfg, HashMap::from([("a".to_string(), backend)])).unwrap();
        assert!(orch.answer(Request::new("x".repeat(11))).await.is_err());
        assert!(orch.answer(Request::new("x".repeat(10))).await.is_ok());
    }

    #[test]
    fn missing_backend_is_config_error() {
        let err = Orchestrator::with_backends(&config(&["a", "b"]), HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBackend(_)));
    }

    #[tokio::test]
    async fn head_provider_answers_with_full_degradation() {
        let orch = orchestrator(&["a", "b"]);
        let resp = orch.answer(Request::new("hello there")).await.unwrap();
        assert_eq!(resp.provider_id, "a");
        assert_eq!(resp.text, "from a");
        assert_eq!(resp.category, TaskCategory::General);
        assert_eq!(resp.degradation, DegradationLevel::Full);
        assert_eq!(resp.confidence, 1.0);
    }

    #[tokio::test]
    async fn override_is_remembered_per_session() {
        let orch = orchestrator(&["a", "b"]);
        let first = orch
            .answer(Request::new("hi").with_session("s1").with_provider_override("b"))
            .await
            .unwrap();
        assert_eq!(first.provider_id, "b");

        let second = orch.answer(Request::new("again").with_session("s1")).await.unwrap();
        assert_eq!(second.provider_id, "b");
        assert_eq!(orch.sessions().turn_count("s1"), 2);

        let other = orch.answer(Request::new("hi").with_session("s2")).await.unwrap();
        assert_eq!(other.provider_id, "a");
    }

    #[tokio::test]
    async fn unknown_override_is_ignored() {
        let orch = orchestrator(&["a", "b"]);
        let resp = orch
            .answer(Request::new("hi").with_provider_override("nope"))
            .await
            .unwrap();
        assert_eq!(resp.provider_id, "a");
    }
}
