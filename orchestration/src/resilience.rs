//! Resilience: degraded answers instead of errors
//!
//! Every orchestrated request produces a [`Response`]. When providers fail,
//! the response says how much of the normal path was available rather than
//! surfacing an error:
//!
//! ```text
//! answer()
//!   ├─ chain head succeeds             → Response { degradation: Full, .. }
//!   ├─ fallback / consensus w/ failures → Response { degradation: Partial, warnings, .. }
//!   └─ nothing succeeds                → Response { degradation: Unavailable, confidence: 0 }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::{ProviderResponse, TokenUsage};
use crate::router::task_classifier::TaskCategory;

/// Provider id reported when no provider produced the answer.
pub const NO_PROVIDER: &str = "none";

/// Text of the synthetic answer returned when every provider failed.
pub const UNAVAILABLE_TEXT: &str =
    "The assistant service is temporarily unavailable. Please try again shortly.";

/// Confidence assumed for a provider that does not report one.
pub const NEUTRAL_CONFIDENCE: f64 = 1.0;

/// How much of the normal serving path produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// The first provider tried answered.
    Full,
    /// A fallback answered, or some consensus participants failed.
    Partial,
    /// No provider answered; the text is the synthetic notice.
    Unavailable,
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Answer to one orchestrated request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub provider_id: String,
    pub text: String,
    /// In [0, 1]. Zero only for the synthetic response.
    pub confidence: f64,
    /// Wall-clock time spent answering, across every provider tried.
    pub latency: Duration,
    pub usage: Option<TokenUsage>,
    pub category: TaskCategory,
    pub degradation: DegradationLevel,
    /// One entry per provider that failed while answering.
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    /// Wrap a provider's answer.
    ///
    /// Degradation is `Full` unless `warnings` records earlier failures.
    pub fn from_provider(
        reply: ProviderResponse,
        category: TaskCategory,
        latency: Duration,
        warnings: Vec<String>,
    ) -> Self {
        let degradation = if warnings.is_empty() {
            DegradationLevel::Full
        } else {
            DegradationLevel::Partial
        };
        Self {
            provider_id: reply.provider,
            text: reply.text,
            confidence: reply
                .confidence
                .unwrap_or(NEUTRAL_CONFIDENCE)
                .clamp(0.0, 1.0),
            latency,
            usage: reply.usage,
            category,
            degradation,
            warnings,
            timestamp: Utc::now(),
        }
    }

    /// The synthetic answer used when no provider succeeded.
    pub fn unavailable(category: TaskCategory, latency: Duration, warnings: Vec<String>) -> Self {
        Self {
            provider_id: NO_PROVIDER.to_string(),
            text: UNAVAILABLE_TEXT.to_string(),
            confidence: 0.0,
            latency,
            usage: None,
            category,
            degradation: DegradationLevel::Unavailable,
            warnings,
            timestamp: Utc::now(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degradation != DegradationLevel::Full
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}
