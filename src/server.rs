//! JSON HTTP API.
//!
//! Every route is a thin wrapper over one [`Engine`] method.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/check-db` | Whether an index exists for `folder` |
//! | `GET`  | `/check-db?folder=` | Same, as a query parameter |
//! | `POST` | `/index` | Start a build (and by default a watch) for `folder` |
//! | `GET`  | `/index-progress` | Current build status |
//! | `POST` | `/search` | Search `folder` for `query` |
//! | `POST` | `/start-monitoring` | Start watching `folder` |
//! | `POST` | `/stop-monitoring` | Stop watching `folder` |
//! | `GET`  | `/monitoring-status?folder=` | Watch state of one folder, or all |
//! | `POST` | `/stop-all-monitoring` | Stop every watch |
//! | `POST` | `/clean-all-indexes` | Delete every index |
//! | `GET`  | `/config` | Current limits and allowed ranges |
//! | `POST` | `/config` | Update limits |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "folder path is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `already_indexing` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a desktop or browser
//! front end can call the API directly.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use findme_core::search::SearchHit;

use crate::engine::{Engine, WatchStatus};
use crate::error::SyncError;
use crate::limits::{LimitsUpdate, LimitsView};
use crate::status::IndexStatus;

/// Bind to `[server] bind` and serve until the process is terminated.
pub async fn run_server(engine: Engine) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let app = router(engine);

    tracing::info!(addr = %bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// The full route table.
pub fn router(engine: Engine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/check-db", post(handle_check_db).get(handle_check_db_query))
        .route("/index", post(handle_index))
        .route("/index-progress", get(handle_index_progress))
        .route("/search", post(handle_search))
        .route("/start-monitoring", post(handle_start_monitoring))
        .route("/stop-monitoring", post(handle_stop_monitoring))
        .route("/monitoring-status", get(handle_monitoring_status))
        .route("/stop-all-monitoring", post(handle_stop_all_monitoring))
        .route("/clean-all-indexes", post(handle_clean_all))
        .route("/config", get(handle_get_config).post(handle_update_config))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(engine)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let (status, code) = match &err {
            e if e.is_client_error() => match e {
                SyncError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                _ => (StatusCode::BAD_REQUEST, "bad_request"),
            },
            SyncError::IndexNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SyncError::AlreadyIndexing => (StatusCode::CONFLICT, "already_indexing"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

/// Plain acknowledgement for operations without a payload.
#[derive(Serialize)]
struct Ack {
    success: bool,
    message: String,
}

fn ack(message: impl Into<String>) -> Json<Ack> {
    Json(Ack {
        success: true,
        message: message.into(),
    })
}

#[derive(Deserialize)]
struct FolderRequest {
    folder: String,
}

// ============ /check-db ============

#[derive(Serialize)]
struct CheckDbResponse {
    exists: bool,
}

async fn handle_check_db(
    State(engine): State<Engine>,
    Json(req): Json<FolderRequest>,
) -> Result<Json<CheckDbResponse>, AppError> {
    let exists = engine.index_exists(&req.folder)?;
    Ok(Json(CheckDbResponse { exists }))
}

async fn handle_check_db_query(
    State(engine): State<Engine>,
    Query(req): Query<FolderRequest>,
) -> Result<Json<CheckDbResponse>, AppError> {
    let exists = engine.index_exists(&req.folder)?;
    Ok(Json(CheckDbResponse { exists }))
}

// ============ /index ============

#[derive(Deserialize)]
struct IndexRequest {
    folder: String,
    /// Also start watching the folder. Defaults to true.
    #[serde(default = "default_true")]
    watch: bool,
}

fn default_true() -> bool {
    true
}

async fn handle_index(State(engine): State<Engine>, Json(req): Json<IndexRequest>) -> Result<Json<Ack>, AppError> {
    let incremental = engine.index_exists(&req.folder)?;
    let handle = engine.start_index(&req.folder)?;
    if req.watch {
        if let Err(e) = engine.start_watch(handle.folder()).await {
            tracing::warn!(folder = %handle.folder(), error = %e, "index started but watch failed");
        }
    }
    Ok(ack(if incremental {
        "starting incremental index update..."
    } else {
        "starting index build..."
    }))
}

async fn handle_index_progress(State(engine): State<Engine>) -> Json<IndexStatus> {
    Json(engine.status())
}

// ============ /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    folder: String,
}

#[derive(Serialize)]
struct SearchResponse {
    success: bool,
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(engine): State<Engine>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let results = engine.search(&req.query, &req.folder).await?;
    Ok(Json(SearchResponse { success: true, results }))
}

// ============ monitoring ============

async fn handle_start_monitoring(
    State(engine): State<Engine>,
    Json(req): Json<FolderRequest>,
) -> Result<Json<Ack>, AppError> {
    let started = engine.start_watch(&req.folder).await?;
    Ok(ack(if started {
        "monitoring started"
    } else {
        "folder is already monitored"
    }))
}

async fn handle_stop_monitoring(
    State(engine): State<Engine>,
    Json(req): Json<FolderRequest>,
) -> Result<Json<Ack>, AppError> {
    let stopped = engine.stop_watch(&req.folder).await?;
    Ok(Json(Ack {
        success: stopped,
        message: if stopped {
            "monitoring stopped".to_string()
        } else {
            "folder is not monitored".to_string()
        },
    }))
}

#[derive(Deserialize)]
struct MonitoringQuery {
    folder: Option<String>,
}

async fn handle_monitoring_status(
    State(engine): State<Engine>,
    Query(q): Query<MonitoringQuery>,
) -> Result<Json<WatchStatus>, AppError> {
    Ok(Json(engine.watch_status(q.folder.as_deref()).await?))
}

async fn handle_stop_all_monitoring(State(engine): State<Engine>) -> Result<Json<Ack>, AppError> {
    let count = engine.stop_all_watches().await?;
    Ok(ack(format!("stopped {} watch(es)", count)))
}

// ============ maintenance ============

async fn handle_clean_all(State(engine): State<Engine>) -> Result<Json<Ack>, AppError> {
    let removed = engine.purge_all().await?;
    Ok(ack(format!("removed {} index(es)", removed)))
}

async fn handle_get_config(State(engine): State<Engine>) -> Json<LimitsView> {
    Json(engine.limits_view())
}

#[derive(Serialize)]
struct ConfigResponse {
    success: bool,
    config: LimitsView,
}

async fn handle_update_config(
    State(engine): State<Engine>,
    Json(update): Json<LimitsUpdate>,
) -> Result<Json<ConfigResponse>, AppError> {
    engine.update_limits(&update)?;
    Ok(Json(ConfigResponse {
        success: true,
        config: engine.limits_view(),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
