//! HTTP surface: recording queries, agent health and on-demand index runs.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{CallIndexError, Result};
use crate::jobs::{run_trigger, AgentSelector, IndexContext, TriggerRequest};
use crate::query::{agent_health, search_recordings, RecordingQuery};

/// HTTP server over an [`IndexContext`]
pub struct HttpServer {
    ctx: Arc<IndexContext>,
    allowed_origins: Vec<String>,
}

#[derive(Clone)]
struct AppState {
    ctx: Arc<IndexContext>,
    shutdown: CancellationToken,
}

/// Error body for failed requests; client mistakes map to 400.
struct ApiError(CallIndexError);

impl From<CallIndexError> for ApiError {
    fn from(err: CallIndexError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            CallIndexError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Body of `POST /index`. No agent means all agents.
#[derive(Debug, Default, Deserialize)]
struct IndexRequest {
    agent: Option<String>,
    since: Option<DateTime<Utc>>,
}

impl HttpServer {
    pub fn new(ctx: IndexContext, allowed_origins: Vec<String>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            allowed_origins,
        }
    }

    /// Serve on `127.0.0.1:<port>` until `shutdown` is cancelled.
    pub async fn run(&self, port: u16, shutdown: CancellationToken) -> Result<()> {
        let app = self.router(shutdown.clone());

        let addr = format!("127.0.0.1:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            CallIndexError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to bind to {}: {}. Set http_server.port in config.toml to use another port.",
                    addr, e
                ),
            ))
        })?;
        log::info!("Serving recordings API on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| {
                CallIndexError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("HTTP server error: {}", e),
                ))
            })?;

        log::info!("HTTP server stopped");
        Ok(())
    }

    /// Build the router; in-flight index runs are cancelled with `shutdown`.
    pub fn router(&self, shutdown: CancellationToken) -> Router {
        // Empty list means no restriction (local use).
        let cors = if self.allowed_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<axum::http::HeaderValue> = self
                .allowed_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(Any)
                .allow_headers(Any)
        };

        Router::new()
            .route("/health", get(handle_health))
            .route("/recordings", get(handle_recordings))
            .route("/agents/health", get(handle_agent_health))
            .route("/index", post(handle_index))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors),
            )
            .with_state(AppState {
                ctx: Arc::clone(&self.ctx),
                shutdown,
            })
    }
}

async fn handle_health() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "callindex",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
        .into_response()
}

async fn handle_recordings(
    State(state): State<AppState>,
    Query(query): Query<RecordingQuery>,
) -> std::result::Result<Response, ApiError> {
    let page = search_recordings(&state.ctx.db, query).await?;
    Ok(Json(page).into_response())
}

async fn handle_agent_health(State(state): State<AppState>) -> std::result::Result<Response, ApiError> {
    let health = state
        .ctx
        .db
        .with_connection(|conn| agent_health(conn, Utc::now()))
        .await?;
    Ok(Json(health).into_response())
}

async fn handle_index(
    State(state): State<AppState>,
    body: Option<Json<IndexRequest>>,
) -> std::result::Result<Response, ApiError> {
    let Json(req) = body.unwrap_or_default();
    let request = TriggerRequest {
        agent: match req.agent {
            Some(agent) => AgentSelector::One(agent),
            None => AgentSelector::All,
        },
        since: req.since,
    };
    let report = run_trigger(&state.ctx, request, state.shutdown.child_token()).await?;
    Ok(Json(report).into_response())
}
