//! HTTP front end for the orchestration core
//!
//! | Route              | Purpose                                   |
//! |--------------------|-------------------------------------------|
//! | `POST /orchestrate` | answer one message                       |
//! | `GET /health`      | liveness plus per-provider circuit state  |
//! | `GET /providers`   | configured providers, without credentials |
//!
//! Provider failures never produce an error status here; the orchestrator
//! degrades instead. The only non-200 answer is 400 for a bad request.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use orchestration::{
    CostClass, HealthSnapshot, Orchestrator, OrchestrationError, ProviderKind, Request,
    TaskCategory,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

pub type AppState = Arc<Orchestrator>;

/// Body of `POST /orchestrate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateBody {
    pub message: String,
    #[serde(default)]
    pub context_hint: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub consensus: bool,
    #[serde(default)]
    pub provider_override: Option<String>,
}

impl From<OrchestrateBody> for Request {
    fn from(body: OrchestrateBody) -> Self {
        let mut request = Request::new(body.message).with_consensus(body.consensus);
        request.context_hint = body.context_hint;
        request.session_id = body.session_id;
        request.provider_override = body.provider_override;
        request
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateReply {
    pub text: String,
    pub provider_used: String,
    pub confidence: f64,
    pub latency_ms: u64,
    pub category: TaskCategory,
    pub degraded: bool,
}

impl From<orchestration::Response> for OrchestrateReply {
    fn from(resp: orchestration::Response) -> Self {
        Self {
            latency_ms: resp.latency_ms(),
            degraded: resp.is_degraded(),
            text: resp.text,
            provider_used: resp.provider_id,
            confidence: resp.confidence,
            category: resp.category,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReply {
    pub status: &'static str,
    pub providers: Vec<HealthSnapshot>,
}

/// Public view of one configured provider.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderView {
    pub id: String,
    pub kind: ProviderKind,
    pub model: String,
    pub capabilities: Vec<String>,
    pub trust_weight: f64,
    pub cost_class: CostClass,
    pub max_concurrent: usize,
    pub timeout_secs: u64,
}

/// Error body: `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        match err {
            OrchestrationError::InvalidRequest(msg) => Self::bad_request(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

async fn orchestrate(
    State(orchestrator): State<AppState>,
    body: Result<Json<OrchestrateBody>, JsonRejection>,
) -> Result<Json<OrchestrateReply>, ApiError> {
    let Json(body) = body?;
    debug!(consensus = body.consensus, "orchestrate request");
    let response = orchestrator.answer(body.into()).await?;
    Ok(Json(response.into()))
}

async fn health(State(orchestrator): State<AppState>) -> Json<HealthReply> {
    Json(HealthReply {
        status: "ok",
        providers: orchestrator.health_snapshot(),
    })
}

async fn providers(State(orchestrator): State<AppState>) -> Json<Vec<ProviderView>> {
    let views = orchestrator
        .providers()
        .iter()
        .map(|p| ProviderView {
            id: p.id.clone(),
            kind: p.kind,
            model: p.model.clone(),
            capabilities: p.capabilities.iter().cloned().collect(),
            trust_weight: p.trust_weight,
            cost_class: p.cost_class,
            max_concurrent: p.max_concurrent,
            timeout_secs: p.timeout.as_secs(),
        })
        .collect();
    Json(views)
}

/// Build the HTTP router over a shared orchestrator.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/orchestrate", post(orchestrate))
        .route("/health", get(health))
        .route("/providers", get(providers))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
