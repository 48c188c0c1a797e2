//! Provider Adapter: one guarded call against one backend
//!
//! The adapter wraps a [`ProviderBackend`] with the per-provider concerns
//! every call shares:
//!
//! ```text
//! invoke()
//!   ├─ wait for a concurrency permit (max_concurrent per provider)
//!   ├─ claim the circuit (spends a half-open trial permit)
//!   ├─ attempt → transient error → backoff → attempt (max 2 retries)
//!   ├─ attempts bounded by the provider timeout, started once the permit is held
//!   └─ exactly one record_success / record_failure on the HealthMonitor
//! ```
//!
//! Queueing for a concurrency slot and a refused circuit claim are local
//! outcomes and leave the HealthMonitor untouched. Once the circuit is
//! claimed, every way out records exactly once, including the caller
//! dropping the future.
//!
//! Callers get either a [`ProviderResponse`] or a typed
//! [`ProviderUnavailable`]; nothing else escapes.

pub mod http;
pub mod retry;
pub mod wire;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{BackendError, ProviderUnavailable};
use crate::registry::ProviderDescriptor;
use crate::router::circuit_breaker::HealthMonitor;
pub use http::HttpBackend;
pub use retry::RetryPolicy;

/// One earlier exchange in the same session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub user: String,
    pub assistant: String,
}

/// Provider-neutral completion request.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// What a backend returns for one successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply {
    pub text: String,
    /// Self-reported confidence in [0, 1], when the backend offers one.
    pub confidence: Option<f64>,
    pub usage: Option<TokenUsage>,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
            usage: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

/// A single attempt against a concrete backend.
///
/// Implementations do no retrying and touch no health state; the adapter
/// owns both.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    async fn generate(&self, request: &BackendRequest) -> Result<BackendReply, BackendError>;
}

/// How a call gets past the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Claim through [`HealthMonitor::try_acquire`]; refused calls are skipped.
    Guarded,
    /// The router's last resort: call whatever the circuit state.
    LastResort,
}

impl Admission {
    pub fn for_chain(last_resort: bool) -> Self {
        if last_resort {
            Self::LastResort
        } else {
            Self::Guarded
        }
    }
}

/// Records a failure for a claimed call that is dropped before it reports.
struct ClaimedCall<'a> {
    health: &'a HealthMonitor,
    provider: &'a str,
    settled: bool,
}

impl<'a> ClaimedCall<'a> {
    fn new(health: &'a HealthMonitor, provider: &'a str) -> Self {
        Self {
            health,
            provider,
            settled: false,
        }
    }

    fn succeeded(mut self) {
        self.settled = true;
        self.health.record_success(self.provider);
    }

    fn failed(mut self) {
        self.settled = true;
        self.health.record_failure(self.provider);
    }
}

impl Drop for ClaimedCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(provider = self.provider, "provider call dropped before completion");
            self.health.record_failure(self.provider);
        }
    }
}

/// Successful result of [`ProviderAdapter::invoke`].
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub provider: String,
    pub text: String,
    pub confidence: Option<f64>,
    /// End to end, including queueing and retries.
    pub latency: Duration,
    pub usage: Option<TokenUsage>,
    pub attempts: u32,
}

/// Per-provider call wrapper shared by failover and consensus.
pub struct ProviderAdapter {
    descriptor: Arc<ProviderDescriptor>,
    backend: Arc<dyn ProviderBackend>,
    health: Arc<HealthMonitor>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("provider", &self.descriptor.id)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl ProviderAdapter {
    pub fn new(
        descriptor: Arc<ProviderDescriptor>,
        backend: Arc<dyn ProviderBackend>,
        health: Arc<HealthMonitor>,
        retry: RetryPolicy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(descriptor.max_concurrent.max(1)));
        Self {
            descriptor,
            backend,
            health,
            retry,
            permits,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<ProviderDescriptor> {
        &self.descriptor
    }

    /// Calls currently in flight (holding a permit).
    pub fn in_flight(&self) -> usize {
        self.descriptor.max_concurrent.max(1) - self.permits.available_permits()
    }

    /// Call the backend with retry, timeout and concurrency limiting.
    ///
    /// The provider timeout bounds every attempt and backoff, starting once
    /// a concurrency slot is held. Cancelling `cancel` while queued gives up
    /// without touching health; after the circuit is claimed it counts as a
    /// failure, as does dropping the returned future.
    pub async fn invoke(
        &self,
        request: &BackendRequest,
        admission: Admission,
        cancel: Option<&CancellationToken>,
    ) -> Result<ProviderResponse, ProviderUnavailable> {
        let provider = self.descriptor.id.as_str();
        let started = Instant::now();
        let unavailable = |attempts: u32, cause: BackendError| ProviderUnavailable {
            provider: provider.to_string(),
            attempts,
            cause,
        };

        let slot = tokio::select! {
            biased;
            _ = cancelled(cancel) => None,
            slot = self.permits.acquire() => slot.ok(),
        };
        let Some(_slot) = slot else {
            debug!(provider, "cancelled while waiting for a concurrency slot");
            return Err(unavailable(0, BackendError::Cancelled));
        };

        if admission == Admission::Guarded && !self.health.try_acquire(provider) {
            debug!(provider, "circuit refused the call, skipping");
            return Err(unavailable(0, BackendError::CircuitOpen));
        }
        let claim = ClaimedCall::new(&self.health, provider);

        let timeout = self.descriptor.timeout;
        let deadline = Instant::now() + timeout;
        let attempts = AtomicU32::new(0);
        let outcome = tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(BackendError::Cancelled),
            result = tokio::time::timeout_at(deadline, self.run(request, deadline, &attempts)) => {
                result.unwrap_or(Err(BackendError::Timeout(timeout)))
            }
        };
        let attempts = attempts.load(Ordering::Relaxed);
        let latency = started.elapsed();

        match outcome {
            Ok(reply) => {
                claim.succeeded();
                debug!(
                    provider,
                    attempts,
                    latency_ms = latency.as_millis() as u64,
                    "provider call succeeded"
                );
                Ok(ProviderResponse {
                    provider: provider.to_string(),
                    text: reply.text,
                    confidence: reply.confidence,
                    latency,
                    usage: reply.usage,
                    attempts,
                })
            }
            Err(cause) => {
                claim.failed();
                warn!(
                    provider,
                    attempts,
                    category = %cause.retry_category(),
                    error = %cause,
                    "provider call failed"
                );
                Err(unavailable(attempts, cause))
            }
        }
    }

    async fn run(
        &self,
        request: &BackendRequest,
        deadline: Instant,
        attempts: &AtomicU32,
    ) -> Result<BackendReply, BackendError> {
        let mut retries_done = 0;
        loop {
            attempts.fetch_add(1, Ordering::Relaxed);
            let err = match self.backend.generate(request).await {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };

            if !err.is_retriable() || !self.retry.should_retry(retries_done) {
                return Err(err);
            }
            retries_done += 1;
            let backoff = self.retry.backoff_duration(retries_done);
            if Instant::now() + backoff >= deadline {
                return Err(err);
            }
            debug!(
                provider = %self.descriptor.id,
                retry = retries_done,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "retrying provider call"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Backend that replays a fixed script of outcomes, for tests and local
/// wiring without network access.
///
/// Each call pops the next scripted outcome; once the script is exhausted
/// the last outcome repeats. An optional delay is applied before every
/// outcome.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Mutex<Vec<Result<BackendReply, BackendError>>>,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<BackendReply, BackendError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().rev().collect()),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(vec![Ok(BackendReply::text(text))])
    }

    pub fn failing(err: BackendError) -> Self {
        Self::new(vec![Err(err)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `generate` calls received so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderBackend for ScriptedBackend {
    async fn generate(&self, _request: &BackendRequest) -> Result<BackendReply, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
        match script.len() {
            0 => Err(BackendError::Transport("empty script".into())),
            1 => script[0].clone(),
            _ => script.pop().unwrap_or(Err(BackendError::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, OrchestratorConfig, ProviderConfig};
    use crate::registry::{ProviderKind, ProviderRegistry};
    use crate::router::circuit_breaker::CircuitState;

    fn setup(timeout_secs: u64) -> (Arc<ProviderDescriptor>, Arc<HealthMonitor>) {
        setup_capped(timeout_secs, None)
    }

    fn setup_capped(
        timeout_secs: u64,
        max_concurrent: Option<usize>,
    ) -> (Arc<ProviderDescriptor>, Arc<HealthMonitor>) {
        let mut provider =
            ProviderConfig::new("p1", ProviderKind::Ollama, "llama3.1").with_timeout_secs(timeout_secs);
        provider.max_concurrent = max_concurrent;
        let config = OrchestratorConfig {
            providers: vec![provider],
            ..Default::default()
        };
        let registry = ProviderRegistry::from_config(&config).unwrap();
        let health = Arc::new(HealthMonitor::new(&registry, &BreakerConfig::default()));
        (registry.get("p1").unwrap().clone(), health)
    }

    fn request() -> BackendRequest {
        BackendRequest {
            system_prompt: "sys".into(),
            history: Vec::new(),
            message: "hello".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_records_health_once() {
        let (descriptor, health) = setup(15);
        let backend = Arc::new(ScriptedBackend::replying("hi there"));
        let adapter =
            ProviderAdapter::new(descriptor, backend.clone(), health.clone(), RetryPolicy::default());

        let response = adapter
            .invoke(&request(), Admission::Guarded, None)
            .await
            .unwrap();
        assert_eq!(response.text, "hi there");
        assert_eq!(response.attempts, 1);
        assert_eq!(backend.calls(), 1);
        let snap = health.snapshot_of("p1").unwrap();
        assert_eq!(snap.total_successes, 1);
        assert_eq!(snap.total_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_then_succeed() {
        let (descriptor, health) = setup(15);
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(BackendError::from_status(503, "busy")),
            Err(BackendError::Transport("reset".into())),
            Ok(BackendReply::text("third time")),
        ]));
        let adapter =
            ProviderAdapter::new(descriptor, backend.clone(), health.clone(), RetryPolicy::default());

        let response = adapter
            .invoke(&request(), Admission::Guarded, None)
            .await
            .unwrap();
        assert_eq!(response.text, "third time");
        assert_eq!(response.attempts, 3);
        // Backoff of 250ms + 500ms elapsed on the paused clock.
        assert!(response.latency >= Duration::from_millis(750));
        assert_eq!(health.failure_count("p1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_capped_at_two() {
        let (descriptor, health) = setup(15);
        let backend = Arc::new(ScriptedBackend::failing(BackendError::from_status(
            500, "boom",
        )));
        let policy = RetryPolicy {
            max_retries: 10,
            ..Default::default()
        };
        let adapter = ProviderAdapter::new(descriptor, backend.clone(), health.clone(), policy);

        let err = adapter
            .invoke(&request(), Admission::Guarded, None)
            .await
            .unwrap_err();
        assert_eq!(err.provider, "p1");
        assert_eq!(err.attempts, 3);
        assert_eq!(backend.calls(), 3);
        // One invocation is one health observation.
        assert_eq!(health.failure_count("p1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let (descriptor, health) = setup(15);
        let backend = Arc::new(ScriptedBackend::failing(BackendError::MissingCredential(
            "OPENAI_API_KEY".into(),
        )));
        let adapter =
            ProviderAdapter::new(descriptor, backend.clone(), health, RetryPolicy::default());

        let err = adapter
            .invoke(&request(), Admission::Guarded, None)
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.cause, BackendError::MissingCredential(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let (descriptor, health) = setup(1);
        let backend = Arc::new(
            ScriptedBackend::replying("too late").with_delay(Duration::from_secs(5)),
        );
        let adapter =
            ProviderAdapter::new(descriptor, backend, health.clone(), RetryPolicy::default());

        let started = Instant::now();
        let err = adapter
            .invoke(&request(), Admission::Guarded, None)
            .await
            .unwrap_err();
        assert!(matches!(err.cause, BackendError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(health.failure_count("p1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_counts_as_failure() {
        let (descriptor, health) = setup(15);
        let backend =
            Arc::new(ScriptedBackend::replying("never").with_delay(Duration::from_secs(10)));
        let adapter =
            ProviderAdapter::new(descriptor, backend, health.clone(), RetryPolicy::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = adapter
            .invoke(&request(), Admission::Guarded, Some(&cancel))
            .await.unwrap_err();
        assert!(matches!(err.cause, BackendError::Cancelled));
        assert_eq!(health.failure_count("p1"), 1);
        assert_eq!(health.state("p1"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn queueing_for_a_slot_does_not_count_against_the_provider() {
        let (descriptor, health) = setup_capped(15, Some(1));
        let backend =
            Arc::new(ScriptedBackend::replying("done").with_delay(Duration::from_secs(10)));
        let adapter = Arc::new(ProviderAdapter::new(
            descriptor,
            backend.clone(),
            health.clone(),
            RetryPolicy::default(),
        ));

        let mut calls = tokio::task::JoinSet::new();
        for _ in 0..5 {
            let adapter = adapter.clone();
            calls.spawn(async move { adapter.invoke(&request(), Admission::Guarded, None).await });
        }
        let mut succeeded = 0;
        while let Some(joined) = calls.join_next().await {
            if joined.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 5);
        assert_eq!(backend.calls(), 5);
        assert_eq!(health.state("p1"), Some(CircuitState::Closed));
        let snap = health.snapshot_of("p1").unwrap();
        assert_eq!((snap.total_successes, snap.total_failures), (5, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_queued_leaves_health_alone() {
        let (descriptor, health) = setup_capped(15, Some(1));
        let backend =
            Arc::new(ScriptedBackend::replying("done").with_delay(Duration::from_secs(10)));
        let adapter = Arc::new(ProviderAdapter::new(
            descriptor,
            backend.clone(),
            health.clone(),
            RetryPolicy::default(),
        ));

        let busy = adapter.clone();
        let first =
            tokio::spawn(async move { busy.invoke(&request(), Admission::Guarded, None).await });
        tokio::task::yield_now().await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = adapter
            .invoke(&request(), Admission::Guarded, Some(&cancel))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, BackendError::Cancelled));
        assert_eq!(err.attempts, 0);

        assert!(first.await.unwrap().is_ok());
        assert_eq!(backend.calls(), 1);
        let snap = health.snapshot_of("p1").unwrap();
        assert_eq!((snap.total_successes, snap.total_failures), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn taken_trial_permit_skips_the_call() {
        let (descriptor, health) = setup(15);
        let backend = Arc::new(ScriptedBackend::replying("back"));
        let adapter =
            ProviderAdapter::new(descriptor, backend.clone(), health.clone(), RetryPolicy::default());
        for _ in 0..3 {
            health.record_failure("p1");
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(health.try_acquire("p1"));

        let err = adapter
            .invoke(&request(), Admission::Guarded, None)
            .await
            .unwrap_err();
        assert!(matches!(err.cause, BackendError::CircuitOpen));
        assert_eq!(backend.calls(), 0);
        assert_eq!(health.failure_count("p1"), 3);
        assert_eq!(health.state("p1"), Some(CircuitState::HalfOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn last_resort_calls_an_open_provider() {
        let (descriptor, health) = setup(15);
        let backend = Arc::new(ScriptedBackend::replying("still here"));
        let adapter =
            ProviderAdapter::new(descriptor, backend.clone(), health.clone(), RetryPolicy::default());
        for _ in 0..3 {
            health.record_failure("p1");
        }

        let guarded = adapter.invoke(&request(), Admission::Guarded, None).await;
        assert!(guarded.is_err());
        let response = adapter
            .invoke(&request(), Admission::LastResort, None)
            .await
            .unwrap();
        assert_eq!(response.text, "still here");
        assert_eq!(backend.calls(), 1);
        assert_eq!(health.state("p1"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_call_is_recorded_as_failure() {
        let (descriptor, health) = setup(15);
        let backend =
            Arc::new(ScriptedBackend::replying("never").with_delay(Duration::from_secs(10)));
        let adapter =
            ProviderAdapter::new(descriptor, backend, health.clone(), RetryPolicy::default());
        for _ in 0..3 {
            health.record_failure("p1");
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let outer = tokio::time::timeout(
            Duration::from_secs(1),
            adapter.invoke(&request(), Admission::Guarded, None),
        )
        .await;
        assert!(outer.is_err());
        // The half-open trial is settled, not stranded.
        assert_eq!(health.failure_count("p1"), 4);
        assert_eq!(health.state("p1"), Some(CircuitState::Open));
    }
}
