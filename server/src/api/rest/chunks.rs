//! Per-file chunk manifest (§6.1 `GET /api/chunks/{path}`).

use axum::{extract::{Path, State}, http::HeaderMap, routing::get, Json, Router};

use super::error::{validate_path, AppError};
use crate::api::AppState;
use crate::auth;
use crate::db;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/chunks/*path", get(get_file_chunks))
}

async fn get_file_chunks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    auth::authenticate(&state, &headers).await?;
    let path = validate_path(&path)?;

    let file = db::files::get_file(&state.db, &path)
        .await?
        .filter(|f| !f.is_trashed())
        .ok_or_else(|| AppError::NotFound(format!("file not found: {path}")))?;

    let hashes = db::files::get_file_chunks(&state.db, file.id).await?;
    Ok(Json(hashes))
}
