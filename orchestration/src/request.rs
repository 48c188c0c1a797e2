//! Inbound request model.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One caller request to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub message: String,
    /// Category name that bypasses keyword classification when it matches.
    pub context_hint: Option<String>,
    pub session_id: Option<String>,
    /// Provider to try first; stored on the session when one is given.
    pub provider_override: Option<String>,
    pub consensus: bool,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context_hint: None,
            session_id: None,
            provider_override: None,
            consensus: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_context_hint(mut self, hint: impl Into<String>) -> Self {
        self.context_hint = Some(hint.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_provider_override(mut self, provider: impl Into<String>) -> Self {
        self.provider_override = Some(provider.into());
        self
    }

    pub fn with_consensus(mut self, consensus: bool) -> Self {
        self.consensus = consensus;
        self
    }

    /// Session id, treating a blank id as absent.
    pub fn session(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
