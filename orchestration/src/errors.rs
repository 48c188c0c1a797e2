//! Error taxonomy for the orchestration core.
//!
//! | Error                 | Raised by        | Caller-visible |
//! |-----------------------|------------------|----------------|
//! | `ConfigError`         | startup          | fatal          |
//! | `BackendError`        | one backend call | no             |
//! | `ProviderUnavailable` | adapter          | no             |
//! | `OrchestrationError`  | orchestrator     | yes            |
//!
//! Provider failures are absorbed by retry, failover and the degraded
//! response path. The only error a caller ever sees is a rejected request.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Fatal configuration problem detected before serving traffic.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no providers configured")]
    NoProviders,

    #[error("provider id must not be empty")]
    EmptyProviderId,

    #[error("duplicate provider id '{0}'")]
    DuplicateProvider(String),

    #[error("provider '{id}': trust weight {weight} outside [0, 1]")]
    TrustWeightOutOfRange { id: String, weight: f64 },

    #[error("provider '{id}': invalid endpoint '{endpoint}'")]
    InvalidEndpoint { id: String, endpoint: String },

    #[error("provider '{id}': timeout must be greater than zero")]
    ZeroTimeout { id: String },

    #[error("routing list '{list}' names unknown provider '{provider}'")]
    UnknownRoutedProvider { list: String, provider: String },

    #[error("unknown task category '{0}'")]
    UnknownCategory(String),

    #[error("invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("could not build HTTP client: {0}")]
    HttpClient(String),

    #[error("no backend supplied for provider '{0}'")]
    MissingBackend(String),
}

/// Classification used by the adapter to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Network error, timeout or 5xx; safe to retry with backoff.
    Transient,
    /// 429 from the backend; retry with backoff.
    RateLimit,
    /// Request or credential problem; retrying cannot help.
    Permanent,
    /// Call was cancelled by the caller or the consensus deadline.
    Cancelled,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Permanent => write!(f, "permanent"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure of a single backend attempt.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("could not decode reply: {0}")]
    Decode(String),

    #[error("credential '{0}' is not set")]
    MissingCredential(String),

    #[error("cancelled")]
    Cancelled,

    /// The breaker refused the call before anything was sent.
    #[error("circuit not accepting calls")]
    CircuitOpen,
}

impl BackendError {
    /// Classify this error for retry logic.
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Timeout(_) | Self::Transport(_) => RetryCategory::Transient,
            Self::Status { status, .. } if *status >= 500 => RetryCategory::Transient,
            Self::Status { status: 429, .. } | Self::RateLimited(_) => RetryCategory::RateLimit,
            Self::Status { .. }
            | Self::Decode(_)
            | Self::MissingCredential(_)
            | Self::CircuitOpen => RetryCategory::Permanent,
            Self::Cancelled => RetryCategory::Cancelled,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }

    /// Map an HTTP status and body to the matching variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == 429 {
            Self::RateLimited(body)
        } else {
            Self::Status { status, body }
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// The adapter gave up on a provider after its retry budget.
#[derive(Debug, Clone, Error)]
#[error("provider '{provider}' unavailable after {attempts} attempt(s): {cause}")]
pub struct ProviderUnavailable {
    pub provider: String,
    pub attempts: u32,
    pub cause: BackendError,
}

/// Errors returned to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The request was malformed (empty message, oversized message).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;
