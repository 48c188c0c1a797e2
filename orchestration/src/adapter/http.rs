//! HTTP backend for OpenAI-compatible, Anthropic and Ollama endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;

use super::wire::{self, ANTHROPIC_VERSION};
use super::{BackendReply, BackendRequest, ProviderBackend};
use crate::errors::{BackendError, ConfigError};
use crate::registry::{ProviderDescriptor, ProviderKind};

/// Longest error body kept in a [`BackendError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// Build the process-wide HTTP client shared by every provider.
pub fn build_client() -> Result<Client, ConfigError> {
    Client::builder()
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}

/// Talks to one provider over HTTP using its native protocol.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    descriptor: Arc<ProviderDescriptor>,
    endpoint: String,
}

impl HttpBackend {
    pub fn new(client: Client, descriptor: Arc<ProviderDescriptor>) -> Self {
        let endpoint = wire::endpoint(descriptor.kind, &descriptor.base_url);
        Self {
            client,
            descriptor,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Auth headers for this provider, resolving the credential now.
    fn headers(&self) -> Result<HeaderMap, BackendError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let secret = match &self.descriptor.credential {
            Some(credential) => Some(
                credential
                    .resolve()
                    .ok_or_else(|| BackendError::MissingCredential(credential.name().to_string()))?,
            ),
            None => None,
        };

        match (self.descriptor.kind, secret) {
            (ProviderKind::Anthropic, secret) => {
                headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
                if let Some(secret) = secret {
                    headers.insert("x-api-key", header_value(&secret)?);
                }
            }
            (_, Some(secret)) => {
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {secret}"))?);
            }
            (_, None) => {}
        }
        Ok(headers)
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, BackendError> {
    HeaderValue::from_str(raw)
        .map_err(|_| BackendError::MissingCredential("credential contains invalid characters".into()))
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut cut = MAX_ERROR_BODY;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &body[..cut])
}

#[async_trait]
impl ProviderBackend for HttpBackend {
    async fn generate(&self, request: &BackendRequest) -> Result<BackendReply, BackendError> {
        let descriptor = &self.descriptor;
        let body = wire::encode_request(
            descriptor.kind,
            &descriptor.model,
            descriptor.max_tokens,
            request,
        );

        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers()?)
            .timeout(descriptor.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| match BackendError::from(e) {
                BackendError::Timeout(_) => BackendError::Timeout(descriptor.timeout),
                other => other,
            })?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(BackendError::from_status(status.as_u16(), truncate(&text)));
        }
        wire::decode_reply(descriptor.kind, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorConfig, ProviderConfig};
    use crate::registry::ProviderRegistry;

    fn descriptor(cfg: ProviderConfig) -> Arc<ProviderDescriptor> {
        let config = OrchestratorConfig {
            providers: vec![cfg],
            ..Default::default()
        };
        let registry = ProviderRegistry::from_config(&config).unwrap();
        registry.list_providers()[0].clone()
    }

    #[test]
    fn endpoint_follows_kind() {
        let mut cfg = ProviderConfig::new("local", ProviderKind::Ollama, "llama3.1");
        cfg.base_url = Some("http://gpu-box:11434/".into());
        let backend = HttpBackend::new(build_client().unwrap(), descriptor(cfg));
        assert_eq!(backend.endpoint(), "http://gpu-box:11434/api/chat");
    }

    #[test]
    fn missing_credential_fails_before_sending() {
        let mut cfg = ProviderConfig::new("openai", ProviderKind::OpenAiCompatible, "gpt-4o-mini");
        cfg.credential_env = Some("ORCH_TEST_UNSET_KEY_5F2A".into());
        let backend = HttpBackend::new(build_client().unwrap(), descriptor(cfg));
        assert!(matches!(
            backend.headers(),
            Err(BackendError::MissingCredential(name)) if name == "ORCH_TEST_UNSET_KEY_5F2A"
        ));
    }

    #[test]
    fn anthropic_headers_carry_version_without_key() {
        let cfg = ProviderConfig::new("claude", ProviderKind::Anthropic, "claude-3-5-haiku-latest");
        let backend = HttpBackend::new(build_client().unwrap(), descriptor(cfg));
        let headers = backend.headers().unwrap();
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "é".repeat(600);
        let cut = truncate(&body);
        assert!(cut.len() <= MAX_ERROR_BODY + 3);
        assert!(cut.ends_with("..."));
    }
}
