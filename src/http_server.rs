//! HTTP server implementation using Axum.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::annotate::{ErrorReview, Review};
use crate::error::PipelineError;
use crate::event::ExitReason;
use crate::state::AppState;
use crate::terminal;

#[derive(Deserialize)]
struct CompileRequest {
    #[serde(default, alias = "sourceCode")]
    code: String,
    #[serde(default)]
    stdin: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompileResponse {
    success: bool,
    output: String,
    error: String,
    os: &'static str,
    exit_code: i32,
    reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_review: Option<ErrorReview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ai_review: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    needs_input: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    os: &'static str,
    java_available: bool,
    interactive_sessions: usize,
    active_runs: usize,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct InfoResponse {
    name: &'static str,
    version: &'static str,
    os: &'static str,
    java_available: bool,
    java_version: Option<String>,
    compile_timeout_ms: u64,
    run_timeout_ms: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(terminal::ws_handler))
        .route("/api/compile", post(compile))
        .route("/api/health", get(api_health))
        .route("/api/info", get(info))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `addr` until Ctrl-C, then close every session.
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    // Spawn cleanup task
    let sweeper = {
        let engine = state.engine.clone();
        tokio::spawn(async move {
            let config = engine.config();
            let mut interval = interval(config.sweep_interval.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = engine.materializer().sweep(config.workspace_max_age).await;
                if removed > 0 {
                    info!(removed, "Swept stale workspaces");
                }
            }
        })
    };

    let app = router(state.clone());
    info!("Starting HTTP server on {}", listener.local_addr()?);

    let on_shutdown = state.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down");
            on_shutdown.begin_shutdown();
        })
        .await;

    sweeper.abort();
    state.registry.close_all().await;
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn api_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        os: std::env::consts::OS,
        java_available: state.engine.config().toolchain.is_available(),
        interactive_sessions: state.registry.len().await,
        active_runs: state.engine.active_runs(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let config = state.engine.config();
    Json(InfoResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        os: std::env::consts::OS,
        java_available: config.toolchain.is_available(),
        java_version: state.java_version.as_deref().map(str::to_string),
        compile_timeout_ms: config.compile_timeout.as_millis() as u64,
        run_timeout_ms: config.run_timeout.as_millis() as u64,
    })
}

async fn compile(
    State(state): State<AppState>,
    Json(req): Json<CompileRequest>,
) -> Result<Json<CompileResponse>, (StatusCode, String)> {
    debug!(
        code_len = req.code.len(),
        stdin_len = req.stdin.as_deref().map_or(0, str::len),
        "POST /api/compile"
    );
    let outcome = state
        .engine
        .run_batch(&req.code, req.stdin.as_deref())
        .await
        .map_err(|e| (status_for(&e), e.to_string()))?;

    let error = outcome.error_text();
    let (error_review, ai_review) = match outcome.review.clone() {
        Some(Review::Rules(review)) => (Some(review), None),
        Some(Review::Ai(text)) => (None, Some(text)),
        None => (None, None),
    };
    info!(
        success = outcome.success,
        exit_code = outcome.exit_code,
        reason = ?outcome.reason,
        "POST /api/compile finished"
    );
    Ok(Json(CompileResponse {
        success: outcome.success,
        output: outcome.stdout,
        error,
        os: std::env::consts::OS,
        exit_code: outcome.exit_code,
        reason: outcome.reason,
        error_review,
        ai_review,
        needs_input: outcome.needs_input,
    }))
}

fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::EmptySource => StatusCode::BAD_REQUEST,
        PipelineError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
