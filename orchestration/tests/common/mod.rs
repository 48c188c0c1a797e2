//! Shared fixtures for orchestration integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use orchestration::{
    BackendError, BackendReply, Orchestrator, OrchestratorConfig, ProviderBackend, ProviderConfig,
    ProviderKind, RetryPolicy, ScriptedBackend,
};

pub type Script = Vec<Result<BackendReply, BackendError>>;

pub fn ok(text: &str) -> Result<BackendReply, BackendError> {
    Ok(BackendReply::text(text))
}

pub fn ok_with_confidence(text: &str, confidence: f64) -> Result<BackendReply, BackendError> {
    Ok(BackendReply::text(text).with_confidence(confidence))
}

pub fn server_error() -> Result<BackendReply, BackendError> {
    Err(BackendError::from_status(503, "upstream overloaded"))
}

/// Config with one OpenAI-compatible provider per id and retries disabled.
pub fn config(ids: &[&str]) -> OrchestratorConfig {
    OrchestratorConfig {
        providers: ids
            .iter()
            .map(|id| ProviderConfig::new(*id, ProviderKind::OpenAiCompatible, "test-model"))
            .collect(),
        retry: RetryPolicy::none(),
        ..Default::default()
    }
}

/// Orchestrator over scripted backends; returns the backends for call counting.
pub fn build(
    config: &OrchestratorConfig,
    backends: Vec<(&str, ScriptedBackend)>,
) -> (Orchestrator, HashMap<String, Arc<ScriptedBackend>>) {
    let handles: HashMap<String, Arc<ScriptedBackend>> = backends
        .into_iter()
        .map(|(id, b)| (id.to_string(), Arc::new(b)))
        .collect();
    let dyn_backends = handles
        .iter()
        .map(|(id, b)| {
            let backend: Arc<dyn ProviderBackend> = b.clone();
            (id.clone(), backend)
        })
        .collect();
    let orchestrator =
        Orchestrator::with_backends(config, dyn_backends).expect("test orchestrator");
    (orchestrator, handles)
}
