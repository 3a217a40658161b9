//! REST API Server for the analysis script orchestrator
//!
//! Exposes one conversation per request over HTTP.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::Orchestrator;
use crate::models::Message;

/// =============================
/// Request Models
/// =============================

/// Either a bare question or a full initial message list
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalysisRequest {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub model: Option<String>,
}

impl AnalysisRequest {
    fn initial_messages(self) -> Option<Vec<Message>> {
        let mut messages = self.messages;
        if let Some(question) = self.question.filter(|q| !q.trim().is_empty()) {
            messages.push(Message::user(question));
        }
        (!messages.is_empty()).then_some(messages)
    }
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

    /// Completed conversation that ended in a soft failure
    pub fn failed<T: Serialize>(data: T, message: String) -> Self {
        Self {
            success: false,
            data: serde_json::to_value(data).ok(),
            error: Some(message),
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
    pub orchestrator: Arc<Orchestrator>,
    pub default_model: String,
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
/// Analysis Endpoint
/// =============================

async fn run_analysis(
    State(state): State<ApiState>,
    Json(req): Json<AnalysisRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let model = req
        .model
        .clone()
        .unwrap_or_else(|| state.default_model.clone());

    let Some(messages) = req.initial_messages() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("question or messages required".into())),
        );
    };

    info!(model = %model, message_count = messages.len(), "Received analysis request");

    match state.orchestrator.run(messages, &model).await {
        Ok(response) if response.success => (StatusCode::OK, Json(ApiResponse::success(response))),
        Ok(response) => {
            let message = response
                .failure
                .as_ref()
                .map(|f| format!("{}: {}", f.kind, f.message))
                .unwrap_or_else(|| "analysis failed".to_string());
            warn!(error = %message, "Analysis ended without a result");
            (StatusCode::OK, Json(ApiResponse::failed(response, message)))
        }
        Err(e) if e.is_hard() => {
            warn!(error = %e, "Analysis could not complete");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ApiResponse::error(format!("analysis could not complete: {}", e))),
            )
        }
        Err(e) => {
            error!(error = %e, "Analysis request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Orchestration failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>, default_model: String) -> Router {
    let state = ApiState {
        orchestrator,
        default_model,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/analysis", post(run_analysis))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    default_model: String,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator, default_model);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
