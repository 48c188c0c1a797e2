//! Multi-provider AI orchestration core
//!
//! This library provides:
//! - A provider registry built from TOML configuration
//! - Per-provider circuit breakers (Closed / Open / HalfOpen)
//! - Keyword task classification and health-aware routing
//! - Provider adapters with timeout, bounded retry and concurrency limits
//! - Sequential failover and parallel trust-weighted consensus
//! - In-memory conversation sessions
//!
//! # Flow
//!
//! ```text
//! Request ─▶ TaskClassifier ─▶ Router (Registry + HealthMonitor)
//!                                 │
//!                 ┌───────────────┴───────────────┐
//!                 ▼                               ▼
//!        failover (sequential)         consensus (K in parallel)
//!                 │                               │
//!                 └──────▶ ProviderAdapter ◀──────┘
//!                                 │
//!                      HealthMonitor updated per call
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use orchestration::{Orchestrator, OrchestratorConfig, Request};
//!
//! let config = OrchestratorConfig::load(Path::new("config/orchestrator.toml"))?;
//! let orchestrator = Orchestrator::from_config(&config)?;
//! let response = orchestrator
//!     .answer(Request::new("What's the price for 50 users?").with_session("abc"))
//!     .await?;
//! println!("{} ({})", response.text, response.provider_id);
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod adapter;
pub mod config;
pub mod ensemble;
pub mod errors;
pub mod orchestrator;
pub mod registry;
pub mod request;
pub mod resilience;
pub mod router;
pub mod session;

// Re-export configuration types
pub use config::{
    BreakerConfig, ConsensusConfig, LimitsConfig, OrchestratorConfig, ProviderConfig,
    RoutingConfig, SessionConfig,
};

// Re-export error types
pub use errors::{
    BackendError, ConfigError, OrchestrationError, OrchestrationResult, ProviderUnavailable,
    RetryCategory,
};

// Re-export provider types
pub use registry::{CostClass, CredentialRef, ProviderDescriptor, ProviderKind, ProviderRegistry};

// Re-export adapter types
pub use adapter::{
    Admission, BackendReply, BackendRequest, ChatTurn, HttpBackend, ProviderAdapter, ProviderBackend,
    ProviderResponse, RetryPolicy, ScriptedBackend, TokenUsage,
};

// Re-export routing types
pub use router::{
    CircuitState, HealthMonitor, HealthSnapshot, ProviderChain, Router, TaskCategory,
    TaskClassifier,
};

// Re-export consensus types
pub use ensemble::{ConsensusAggregator, ConsensusOutcome};

pub use orchestrator::Orchestrator;
pub use request::Request;
pub use resilience::{DegradationLevel, Response};
pub use session::{SessionStore, SessionTurn};
