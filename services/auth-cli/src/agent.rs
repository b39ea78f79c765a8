//! Long-running session agent (`school-auth serve`)
//!
//! Restores the persisted session, keeps it fresh, and exposes a small
//! local HTTP surface:
//!
//! - `GET /health`: liveness plus whether a user is signed in
//! - `GET /metrics`: Prometheus text exposition
//! - `GET /session`: the auth state snapshot (tokens omitted)
//! - `POST /deep-link`: hand over a callback URL received out of band
//! - `POST /logout`: sign out

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use auth_core::Error as AuthError;
use auth_session::AuthSessionController;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::record_request;

/// Time allowed for in-flight requests after a shutdown signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for all handlers
#[derive(Clone)]
pub struct AgentState {
    pub controller: Arc<AuthSessionController>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

#[derive(Debug, Deserialize)]
struct DeepLinkRequest {
    url: String,
}

/// Build the agent router. The concurrency limit caps simultaneous
/// requests at `max_connections`.
pub fn build_router(state: AgentState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session", get(session_handler))
        .route("/deep-link", post(deep_link_handler))
        .route("/logout", post(logout_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// HTTP status for a failed session operation.
fn status_for(error: &AuthError) -> StatusCode {
    match error {
        AuthError::InvalidCredentials | AuthError::EmailUnconfirmed => StatusCode::UNAUTHORIZED,
        AuthError::OAuth(_)
        | AuthError::MissingTokens(_)
        | AuthError::UserCancelled
        | AuthError::UserDismissed
        | AuthError::InvalidEmailFormat
        | AuthError::WeakPassword(_) => StatusCode::BAD_REQUEST,
        AuthError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        AuthError::Superseded => StatusCode::CONFLICT,
        AuthError::NetworkUnreachable(_) => StatusCode::BAD_GATEWAY,
        AuthError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &AuthError) -> Response {
    (
        status_for(error),
        Json(serde_json::json!({
            "error": error.to_string(),
            "category": error.category(),
        })),
    )
        .into_response()
}

async fn health_handler(State(state): State<AgentState>) -> impl IntoResponse {
    let auth = state.controller.state().await;
    Json(serde_json::json!({
        "status": "healthy",
        "authenticated": auth.is_authenticated,
        "phase": auth.phase,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn metrics_handler(State(state): State<AgentState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn session_handler(State(state): State<AgentState>) -> impl IntoResponse {
    Json(state.controller.state().await)
}

async fn deep_link_handler(
    State(state): State<AgentState>,
    Json(request): Json<DeepLinkRequest>,
) -> Response {
    let start = Instant::now();
    let response = match state.controller.handle_deep_link(&request.url).await {
        Ok(Some(session)) => Json(serde_json::json!({
            "handled": true,
            "user": session.user,
        }))
        .into_response(),
        Ok(None) => Json(serde_json::json!({ "handled": false })).into_response(),
        Err(e) => error_response(&e),
    };
    record_request(
        "/deep-link",
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

async fn logout_handler(State(state): State<AgentState>) -> Response {
    let start = Instant::now();
    let response = match state.controller.logout().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    };
    record_request(
        "/logout",
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Run the agent until SIGINT/SIGTERM.
pub async fn serve(
    config: &Config,
    controller: Arc<AuthSessionController>,
    prometheus: PrometheusHandle,
) -> Result<()> {
    match controller.load_persisted_session().await {
        Ok(session) => info!(
            principal_id = %session.user.auth_principal_id,
            "restored persisted session"
        ),
        Err(AuthError::NotFound(_)) => info!("no persisted session, waiting for sign-in"),
        Err(e) => warn!(error = %e, "could not restore persisted session"),
    }

    controller.start_auth_listener();
    let refresh_task = auth_session::spawn_refresh_task(
        controller.clone(),
        Duration::from_secs(config.agent.refresh_interval_secs),
        Duration::from_secs(config.agent.refresh_threshold_secs),
    );
    let _subscription = controller.subscribe_to_auth_changes(|user| match user {
        Some(user) => info!(principal_id = %user.auth_principal_id, role = %user.role, "signed in"),
        None => info!("signed out"),
    });

    let state = AgentState {
        controller: controller.clone(),
        prometheus,
        started_at: Instant::now(),
    };
    let app = build_router(state, config.agent.max_connections);

    let listen_addr = config.agent.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "agent accepting requests");

    // The drain timer starts at the signal, not at server start.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    refresh_task.abort();
    controller.stop_auth_listener();
    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
