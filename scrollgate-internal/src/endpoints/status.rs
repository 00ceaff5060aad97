use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::gateway_util::{AppState, AppStateData};
use crate::llm::LlmProviderKind;
use crate::rate_limit::RateLimiterMetricsSnapshot;
use crate::session_memory::SessionMemoryMetricsSnapshot;
use crate::usage_limit::TokenLedgerMetricsSnapshot;

pub const SCROLLGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub store: &'static str,
    pub llm_provider: LlmProviderKind,
    pub rate_limiter: RateLimiterMetricsSnapshot,
    pub ledger: TokenLedgerMetricsSnapshot,
    pub session_memory: SessionMemoryMetricsSnapshot,
}

/// A handler for a simple liveness check plus component counters
pub async fn status_handler(State(app_state): AppState) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        version: SCROLLGATE_VERSION,
        store: app_state.store.kind(),
        llm_provider: app_state.llm.kind(),
        rate_limiter: app_state.rate_limiter.metrics(),
        ledger: app_state.ledger.metrics(),
        session_memory: app_state.session_memory.metrics().await,
    })
}

/// A handler for a health check that includes the durable store
pub async fn health_handler(
    State(AppStateData { store, .. }): AppState,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match store.health().await {
        Ok(()) => Ok(Json(json!({ "gateway": "ok", "store": "ok" }))),
        Err(_) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "gateway": "ok", "store": "error" })),
        )),
    }
}
