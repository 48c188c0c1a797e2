//! The shipped sample configuration must load and build

use std::path::PathBuf;

use orchestration::{Orchestrator, OrchestratorConfig, ProviderKind, TaskCategory};

fn sample_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/orchestrator.toml")
}

#[test]
fn test_sample_config_builds_orchestrator() {
    let config = OrchestratorConfig::load(&sample_path()).unwrap();
    assert_eq!(config.providers.len(), 3);
    assert_eq!(config.providers[2].kind, ProviderKind::Ollama);

    let orchestrator = Orchestrator::from_config(&config).unwrap();
    let sales: Vec<String> = orchestrator
        .registry()
        .by_category(TaskCategory::Sales)
        .iter()
        .map(|p| p.id.clone())
        .collect();
    assert_eq!(sales, ["openai", "claude"]);

    let local = orchestrator.registry().get("local-llama").unwrap();
    assert_eq!(local.max_concurrent, 4);
    assert_eq!(local.timeout.as_secs(), 30);
}
