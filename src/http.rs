use crate::engine::{Engine, EngineStatus};
use crate::error::{CacheError, EngineError};
use crate::model::{CacheEntry, CacheSearchParam, CacheStore};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilenamesRequest {
    filenames: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AffectedResponse {
    affected: usize,
}

fn map_error(err: EngineError) -> (StatusCode, String) {
    let status = match &err {
        EngineError::UnknownConnector { .. } => StatusCode::NOT_FOUND,
        EngineError::Cache(CacheError::NotFound(..)) => StatusCode::NOT_FOUND,
        EngineError::Cache(CacheError::Busy(_)) => StatusCode::CONFLICT,
        EngineError::Cache(CacheError::InvalidName(_)) => StatusCode::BAD_REQUEST,
        EngineError::Config(_) | EngineError::ConnectorExists { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

async fn list_cache(
    State(state): State<HttpState>,
    Path((north_id, store)): Path<(String, CacheStore)>,
    Query(filter): Query<CacheSearchParam>,
) -> Result<Json<Vec<CacheEntry>>, (StatusCode, String)> {
    let entries = state
        .engine
        .list_cache_content(&north_id, store, &filter)
        .map_err(map_error)?;
    Ok(Json(entries))
}

async fn retry_errors(
    State(state): State<HttpState>,
    Path(north_id): Path<String>,
    Json(payload): Json<FilenamesRequest>,
) -> Result<Json<AffectedResponse>, (StatusCode, String)> {
    let affected = state
        .engine
        .retry_error_content(&north_id, &payload.filenames)
        .map_err(map_error)?;
    Ok(Json(AffectedResponse { affected }))
}

async fn retry_all_errors(
    State(state): State<HttpState>,
    Path(north_id): Path<String>,
) -> Result<Json<AffectedResponse>, (StatusCode, String)> {
    let affected = state
        .engine
        .retry_all_error_content(&north_id)
        .map_err(map_error)?;
    Ok(Json(AffectedResponse { affected }))
}

async fn remove_all(
    State(state): State<HttpState>,
    Path((north_id, store)): Path<(String, CacheStore)>,
) -> Result<Json<AffectedResponse>, (StatusCode, String)> {
    let affected = state
        .engine
        .remove_all_content(&north_id, store)
        .map_err(map_error)?;
    Ok(Json(AffectedResponse { affected }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/north/{north_id}/cache/{store}", get(list_cache))
        .route("/v1/north/{north_id}/cache/{store}/remove-all", post(remove_all))
        .route("/v1/north/{north_id}/retry-errors", post(retry_errors))
        .route("/v1/north/{north_id}/retry-all-errors", post(retry_all_errors))
        .with_state(state)
}
