//! Control endpoints served to the manager
//!
//! - `POST /api/feeds`  - deliver a [`FeedPack`]
//! - `POST /api/logout` - end the current session
//! - `GET  /health`     - liveness and queue figures
//! - `GET  /metrics`    - Prometheus text format

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use super::session::SessionHandle;
use crate::crawler::pool::AcceptOutcome;
use crate::metrics;
use crate::models::FeedPack;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub session: SessionHandle,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
struct AcceptResponse {
    added: usize,
    updated: usize,
    removed: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Json<Self> {
        Json(Self {
            error: error.into(),
        })
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    session: Option<String>,
    tracked_feeds: usize,
    queue_depth: usize,
    pending_updates: usize,
}

/// Build the control router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/feeds", post(accept_feeds))
        .route("/api/logout", post(logout))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

async fn accept_feeds(
    State(state): State<AppState>,
    Json(pack): Json<FeedPack>,
) -> impl IntoResponse {
    let Some(pool) = state.session.pool().await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new("no open session"),
        )
            .into_response();
    };

    match pool.accept_feeds(pack).await {
        AcceptOutcome::Accepted {
            added,
            updated,
            removed,
        } => (
            StatusCode::OK,
            Json(AcceptResponse {
                added,
                updated,
                removed,
            }),
        )
            .into_response(),
        AcceptOutcome::SessionMismatch => {
            state.session.request_logout().await;
            (StatusCode::CONFLICT, ErrorResponse::new("session mismatch")).into_response()
        }
    }
}

async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    if !state.session.request_logout().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorResponse::new("no open session"),
        )
            .into_response();
    }
    tracing::info!("Logout requested over control API");
    StatusCode::ACCEPTED.into_response()
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut health = HealthResponse {
        status: "logged_out",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        session: None,
        tracked_feeds: 0,
        queue_depth: 0,
        pending_updates: 0,
    };

    if let Some(pool) = state.session.pool().await {
        let tables = pool.tables().read().await;
        health.status = if tables.request_feeds { "pulling" } else { "degraded" };
        health.session = tables.session.as_ref().map(ToString::to_string);
        health.tracked_feeds = tables.feeds.len();
        health.pending_updates = tables.pending_updates();
        health.queue_depth = pool.queue().len();
    }

    Json(health)
}

async fn metrics_text() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::new(e.to_string()),
        )
            .into_response(),
    }
}

/// Errors from the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("Failed to bind: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    ServeError(String),
}

/// axum server for the control endpoints
pub struct ControlServer {
    addr: SocketAddr,
    state: AppState,
}

impl ControlServer {
    pub fn new(listen_addr: &str, session: SessionHandle) -> Result<Self, ServerError> {
        let addr = listen_addr
            .parse()
            .map_err(|_| ServerError::InvalidAddress(listen_addr.to_string()))?;
        Ok(Self {
            addr,
            state: AppState {
                session,
                start_time: Instant::now(),
            },
        })
    }

    pub fn build_router(&self) -> Router {
        create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown_signal` completes
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        tracing::info!(addr = %self.addr, "Control server listening");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::ServeError(e.to_string()))?;

        tracing::info!("Control server shutdown complete");
        Ok(())
    }
}
