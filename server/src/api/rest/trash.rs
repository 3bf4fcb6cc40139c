//! Trash listing and restore (§6.1 `/api/trash*`).

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};

use super::error::{validate_path, AppError};
use super::types::FileResponse;
use crate::api::AppState;
use crate::auth;
use crate::db;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/trash", get(list_trash))
        // Axum wildcards must be the final path segment, so the literal
        // `.../restore` suffix is matched inside the handler rather than
        // the route pattern.
        .route("/api/trash/*path_and_restore", post(restore_file))
}

async fn list_trash(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Vec<FileResponse>>, AppError> {
    auth::authenticate(&state, &headers).await?;
    let files = db::files::list_trash(&state.db)
        .await?
        .into_iter()
        .map(FileResponse::from)
        .collect();
    Ok(Json(files))
}

async fn restore_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path_and_restore): Path<String>,
) -> Result<Json<FileResponse>, AppError> {
    let machine_id = auth::authenticate(&state, &headers).await?;

    let path = path_and_restore
        .strip_suffix("/restore")
        .ok_or_else(|| AppError::NotFound("expected /api/trash/{path}/restore".to_string()))?;
    let path = validate_path(path)?;

    let file = db::files::restore_file(&state.db, &path, machine_id).await?;
    state.hub.notify_file_change(machine_id, "CREATED", &path).await;
    Ok(Json(file.into()))
}
