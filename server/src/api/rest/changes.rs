//! Incremental change log (§6.1 `/api/changes*`, C3's `get_changes`).

use axum::{extract::{Query, State}, http::HeaderMap, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::AppError;
use super::types::{ChangeEntryResponse, ChangesResponse};
use crate::api::AppState;
use crate::auth;
use crate::db;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/changes", get(get_changes))
        .route("/api/changes/latest", get(get_latest))
}

#[derive(Deserialize)]
struct ChangesQuery {
    since: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

async fn get_changes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, AppError> {
    auth::authenticate(&state, &headers).await?;

    let limit = query.limit.unwrap_or(state.config.max_changes_page).min(state.config.max_changes_page);
    // Fetch one extra row to detect whether more entries remain beyond this page.
    let mut entries = db::changes::changes_since(&state.db, query.since, limit + 1).await?;
    let has_more = entries.len() as i64 > limit;
    entries.truncate(limit as usize);

    let latest_timestamp = entries
        .last()
        .map(|e| e.timestamp)
        .or(query.since)
        .unwrap_or_else(Utc::now);

    Ok(Json(ChangesResponse {
        changes: entries.into_iter().map(ChangeEntryResponse::from).collect(),
        has_more,
        latest_timestamp: latest_timestamp.to_rfc3339(),
    }))
}

#[derive(Serialize)]
struct LatestResponse {
    latest_timestamp: String,
}

async fn get_latest(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<LatestResponse>, AppError> {
    auth::authenticate(&state, &headers).await?;
    let latest = db::changes::latest_change_timestamp(&state.db)
        .await?
        .unwrap_or_else(Utc::now);
    Ok(Json(LatestResponse { latest_timestamp: latest.to_rfc3339() }))
}
