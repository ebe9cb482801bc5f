//! REST API Server for the Finance Chat Engine
//!
//! Exposes the conversational engine via HTTP endpoints
//! Integrates with frontend UI

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::engine::{ChatEngine, TurnRequest};
use crate::error::EngineError;
use crate::models::CategoryCandidate;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub is_onboarding: bool,
    pub categories: Option<Vec<CategoryCandidate>>,
    pub timezone: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<ChatEngine>,
}

/// =============================
/// Helpers — Stable User Ids
/// =============================

fn stable_uuid_from_string(input: &str) -> uuid::Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes)
}

fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> uuid::Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            uuid::Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

fn error_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Throttled(_) | EngineError::QuotaExceeded { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        EngineError::AssistantUnavailable(_) | EngineError::Protocol(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Message must not be empty".into())),
        );
    }

    let user_id = parse_or_stable_uuid(req.user_id.as_deref(), "anonymous-user");
    info!(user_id = %user_id, "Received chat turn");

    let turn = TurnRequest {
        user_id,
        message: req.message,
        thread_id: req.thread_id,
        is_onboarding: req.is_onboarding,
        categories: req.categories,
        timezone: req.timezone,
    };

    match state.engine.handle_turn(turn).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "message": outcome.message,
                "threadId": outcome.thread_id,
                "executedActions": outcome.executed_actions,
                "usage": outcome.usage,
                "warning": outcome.warning,
            }))),
        ),
        Err(error) => (
            error_status(&error),
            Json(ApiResponse::error(error.to_string())),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(engine: Arc<ChatEngine>) -> Router {
    let state = ApiState { engine };

    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    engine: Arc<ChatEngine>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(engine);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_uuid_is_deterministic_and_rfc4122() {
        let a = stable_uuid_from_string("user-123");
        let b = stable_uuid_from_string("user-123");
        let c = stable_uuid_from_string("user-456");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 4);
    }

    #[test]
    fn valid_uuid_passes_through_unhashed() {
        let raw = "7b5e2b9c-4f2a-4f5f-8a3e-2a1b9c8d7e6f";
        let parsed = parse_or_stable_uuid(Some(raw), "fallback");
        assert_eq!(parsed.to_string(), raw);
    }

    #[test]
    fn error_statuses_map_by_class() {
        assert_eq!(
            error_status(&EngineError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&EngineError::QuotaExceeded { used: 3, limit: 3 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            error_status(&EngineError::AssistantUnavailable("down".into())),
            StatusCode::BAD_GATEWAY
        );
    }
}
