// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication; everything else requires a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten allowed origins
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::api::ApiState;
use crate::engine::ScanSpec;
use crate::error::ScanError;
use crate::filters::FilterConfig;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Scans (authenticated) ───────────────────────────────────
        .route("/api/v1/scans", post(start_scan).get(list_scans))
        .route("/api/v1/scans/:id", delete(stop_scan))
        .route("/api/v1/scans/:id/status", get(scan_status))
        .route(
            "/api/v1/scans/:id/filters",
            get(get_filters).put(update_filters),
        )
        .route("/api/v1/scans/:id/results", get(scan_results))
        // ── Presets (authenticated) ─────────────────────────────────
        .route("/api/v1/presets", get(list_presets))
        .route(
            "/api/v1/presets/:id",
            get(get_preset).put(put_preset).delete(delete_preset),
        )
        // ── Subscription stream (token via query param) ─────────────
        .route("/api/v1/scans/:id/stream", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

/// Map an admission error to its HTTP response. Shared with the WebSocket
/// upgrade path so both surfaces reject with the same taxonomy.
pub(crate) fn error_response(e: &ScanError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        ScanError::Config(_) | ScanError::Protocol(_) => StatusCode::BAD_REQUEST,
        ScanError::Overload(_) => StatusCode::TOO_MANY_REQUESTS,
        ScanError::Deadline => StatusCode::GATEWAY_TIMEOUT,
        ScanError::CircuitOpen | ScanError::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
        ScanError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": e.to_string(), "kind": e.kind() })),
    )
}

fn not_found(what: &str, id: Uuid) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("unknown {what}: {id}") })),
    )
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "server_time": chrono::Utc::now().timestamp_millis(),
        "engine": state.engine.engine_stats(),
    }))
}

// =============================================================================
// Scan lifecycle (authenticated)
// =============================================================================

#[derive(Serialize)]
struct StartScanResponse {
    scan_id: Uuid,
    subscribe_uri: String,
}

async fn start_scan(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Json(spec): Json<ScanSpec>,
) -> impl IntoResponse {
    match state.engine.start_scan(spec) {
        Ok(scan_id) => {
            info!(scan_id = %scan_id, "scan created via API");
            (
                StatusCode::CREATED,
                Json(StartScanResponse {
                    scan_id,
                    subscribe_uri: format!("/api/v1/scans/{scan_id}/stream"),
                }),
            )
                .into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

async fn list_scans(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let statuses: Vec<_> = state
        .engine
        .scan_ids()
        .into_iter()
        .filter_map(|id| state.engine.status(id))
        .collect();
    Json(serde_json::json!({ "scans": statuses }))
}

async fn stop_scan(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    if state.engine.stop_scan(id) {
        info!(scan_id = %id, "scan stopped via API");
        Json(serde_json::json!({ "stopped": id })).into_response()
    } else {
        not_found("scan", id).into_response()
    }
}

async fn scan_status(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.status(id) {
        Some(status) => Json(status).into_response(),
        None => not_found("scan", id).into_response(),
    }
}

// =============================================================================
// Filters (authenticated)
// =============================================================================

async fn get_filters(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.get_filters(id) {
        Some(configs) => Json(serde_json::json!({ "filters": configs })).into_response(),
        None => not_found("scan", id).into_response(),
    }
}

async fn update_filters(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(configs): Json<Vec<FilterConfig>>,
) -> impl IntoResponse {
    match state.engine.update_filters(id, &configs) {
        None => not_found("scan", id).into_response(),
        Some(Ok(applied)) => {
            info!(scan_id = %id, filters = applied.len(), "filters updated via API");
            Json(serde_json::json!({ "applied_config": applied })).into_response()
        }
        Some(Err(e)) => error_response(&e).into_response(),
    }
}

// =============================================================================
// Results (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct ResultsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    since: Option<u64>,
}

fn default_limit() -> usize {
    50
}

async fn scan_results(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<ResultsQuery>,
) -> impl IntoResponse {
    match state.engine.results_page(id, q.limit, q.offset, q.since) {
        Some(page) => Json(page).into_response(),
        None => not_found("scan", id).into_response(),
    }
}

// =============================================================================
// Presets (authenticated)
// =============================================================================

async fn list_presets(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    Json(serde_json::json!({ "presets": state.presets.list() }))
}

async fn get_preset(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.presets.get(&id) {
        Some(blob) => Json(blob).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown preset: {id}") })),
        )
            .into_response(),
    }
}

async fn put_preset(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(blob): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.presets.put(id.clone(), blob) {
        Ok(replaced) => Json(serde_json::json!({ "id": id, "replaced": replaced })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn delete_preset(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.presets.delete(&id) {
        Ok(true) => Json(serde_json::json!({ "deleted": id })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown preset: {id}") })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
