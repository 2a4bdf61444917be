//! Trail API handlers.
//!
//! Provides:
//! - `GET /trails` - paginated, sortable search
//! - `GET /trails/enumerate` - distinct component ids
//! - `POST /trails` - create
//! - `GET|PUT|DELETE /trails/{id}` - read, replace, remove

use crate::api::ApiError;
use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use trail_core::{EnumerateCriteria, SearchCriteria, Trail};

/// Turns decoded query parameters into the loose JSON object the criteria
/// parsers expect. Every value stays a string.
fn query_to_value(params: HashMap<String, String>) -> Value {
    Value::Object(
        params
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect(),
    )
}

fn parse_trail_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid trail id {raw}.")))
}

fn json_body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Handler for `GET /trails`.
pub async fn search_trails_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Trail>>, ApiError> {
    let criteria = SearchCriteria::try_from(&query_to_value(params))?;
    let trails = state.manager.search(&criteria).await?;
    Ok(Json(trails))
}

/// Handler for `GET /trails/enumerate`.
pub async fn enumerate_trails_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<String>>, ApiError> {
    let criteria = EnumerateCriteria::try_from(&query_to_value(params))?;
    let ids = state.manager.enumerate(&criteria).await?;
    Ok(Json(ids))
}

/// Handler for `POST /trails`.
///
/// Responds `201 Created` with the stored trail.
pub async fn create_trail_handler(
    Extension(state): Extension<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Trail>), ApiError> {
    let body = json_body(payload)?;
    let id = state.manager.insert(&body).await?;

    let trail = state
        .manager
        .get(id)
        .await?
        .ok_or_else(|| ApiError::InternalServerError(format!("trail {id} vanished after insert")))?;

    tracing::info!(trail_id = id, "trail created");
    Ok((StatusCode::CREATED, Json(trail)))
}

/// Handler for `GET /trails/{id}`.
pub async fn get_trail_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Trail>, ApiError> {
    let id = parse_trail_id(&raw_id)?;
    let trail = state
        .manager
        .get(id)
        .await?
        .ok_or_else(|| ApiError::trail_not_found(id))?;
    Ok(Json(trail))
}

/// Handler for `PUT /trails/{id}`.
///
/// Responds `202 Accepted` with the stored trail.
pub async fn update_trail_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(raw_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Trail>), ApiError> {
    let id = parse_trail_id(&raw_id)?;
    let body = json_body(payload)?;

    if !state.manager.update(id, &body).await? {
        return Err(ApiError::trail_not_found(id));
    }

    let trail = state
        .manager
        .get(id)
        .await?
        .ok_or_else(|| ApiError::trail_not_found(id))?;
    Ok((StatusCode::ACCEPTED, Json(trail)))
}

/// Handler for `DELETE /trails/{id}`.
pub async fn delete_trail_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_trail_id(&raw_id)?;

    if !state.manager.delete(id).await? {
        return Err(ApiError::trail_not_found(id));
    }

    tracing::info!(trail_id = id, "trail deleted");
    Ok(StatusCode::NO_CONTENT)
}
