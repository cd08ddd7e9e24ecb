//! REST API for the message pipeline
//!
//! Exposes batch processing over HTTP

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::models::MessageRecord;
use crate::pipeline::Pipeline;
use crate::validation::Evaluator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchRequest {
    pub messages: Vec<serde_json::Value>,
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
    pub pipeline: Arc<Pipeline>,
    /// Cancelled on server shutdown; every batch runs under a child token
    pub shutdown: CancellationToken,
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
/// Batch Endpoint
/// =============================

async fn process_batch(
    State(state): State<ApiState>,
    Json(req): Json<BatchRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!(messages = req.messages.len(), "Received batch");

    let cancel = state.shutdown.child_token();
    let report = state.pipeline.run(req.messages, &cancel).await;

    (StatusCode::OK, Json(ApiResponse::success(report)))
}

/// =============================
/// Validation Endpoint
/// =============================

/// Rule evaluation only: no correction, no scoring
async fn validate_message(
    State(state): State<ApiState>,
    Json(raw): Json<serde_json::Value>,
) -> (StatusCode, Json<ApiResponse>) {
    let message = match MessageRecord::from_raw(&raw, "MSG-0001") {
        Ok(message) => message,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("Invalid message: {}", e))),
            )
        }
    };

    let evaluator = Evaluator::with_default_rules(state.pipeline.config().validation.clone());
    let evaluation = evaluator.evaluate(&message);

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "message_id": message.message_id,
            "valid": evaluation.is_valid(),
            "violations": evaluation.violations,
        }))),
    )
}

/// =============================
/// Router
/// =============================

pub fn create_router(pipeline: Arc<Pipeline>, shutdown: CancellationToken) -> Router {
    let state = ApiState { pipeline, shutdown };

    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/api/batches", post(process_batch))
        .route("/api/messages/validate", post(validate_message))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    pipeline: Arc<Pipeline>,
    port: u16,
    shutdown: CancellationToken,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(pipeline, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
