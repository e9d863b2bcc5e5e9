use crate::config::{AppState, ServerConfig};
use crate::websocket;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskloom_core::{GraphError, RunError};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server
pub async fn serve(config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let app = create_router(Arc::new(state));

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Create the API router
pub(crate) fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/step-kinds", get(handlers::list_step_kinds))
        .route("/api/tools", get(handlers::list_tools))
        .route(
            "/api/runs",
            get(handlers::list_runs).post(handlers::submit_run),
        )
        .route("/api/runs/plan", post(handlers::plan_run))
        .route(
            "/api/runs/{run_id}",
            get(handlers::get_run).delete(handlers::delete_run),
        )
        .route("/api/runs/{run_id}/cancel", post(handlers::cancel_run))
        .route("/api/ws", get(websocket::ws_handler))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskloom",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error returned by API handlers, rendered as [`ErrorResponse`]
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, anyhow::anyhow!(message.into()))
    }
}

/// Status code for the engine errors callers can act on
fn status_for(error: &anyhow::Error) -> StatusCode {
    if error.downcast_ref::<GraphError>().is_some() {
        return StatusCode::BAD_REQUEST;
    }
    match error.downcast_ref::<RunError>() {
        Some(RunError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(RunError::NotActive(_)) => StatusCode::CONFLICT,
        Some(RunError::Graph(_)) => StatusCode::BAD_REQUEST,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        if self.status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }

        let response = ErrorResponse {
            error,
            details: (!details.is_empty()).then_some(details),
        };

        (self.status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        Self {
            status: status_for(&error),
            error,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
