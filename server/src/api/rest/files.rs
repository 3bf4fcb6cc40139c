//! File record CRUD (§6.1 `/api/files*`).

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::error::{validate_path, AppError};
use super::types::FileResponse;
use crate::api::AppState;
use crate::auth;
use crate::db;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/files", get(list_files).post(create_file))
        .route(
            "/api/files/*path",
            get(get_file).put(update_file).delete(delete_file),
        )
}

#[derive(Deserialize)]
struct ListFilesQuery {
    prefix: Option<String>,
}

async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<Vec<FileResponse>>, AppError> {
    auth::authenticate(&state, &headers).await?;
    let files = db::files::list_files(&state.db, query.prefix.as_deref())
        .await?
        .into_iter()
        .map(FileResponse::from)
        .collect();
    Ok(Json(files))
}

#[derive(Deserialize)]
struct CreateFileRequest {
    path: String,
    size: i64,
    content_hash: String,
    chunks: Vec<String>,
}

async fn create_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateFileRequest>,
) -> Result<(StatusCode, Json<FileResponse>), AppError> {
    let machine_id = auth::authenticate(&state, &headers).await?;
    let path = validate_path(&req.path)?;

    let file = db::files::create_file(&state.db, &path, req.size, &req.content_hash, machine_id).await?;
    db::files::set_file_chunks(&state.db, file.id, &req.chunks).await?;

    state.hub.notify_file_change(machine_id, "CREATED", &path).await;
    Ok((StatusCode::CREATED, Json(file.into())))
}

async fn get_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<Json<FileResponse>, AppError> {
    auth::authenticate(&state, &headers).await?;
    let path = validate_path(&path)?;

    let file = db::files::get_file(&state.db, &path)
        .await?
        .filter(|f| !f.is_trashed())
        .ok_or_else(|| AppError::NotFound(format!("file not found: {path}")))?;
    Ok(Json(file.into()))
}

#[derive(Deserialize)]
struct UpdateFileRequest {
    size: i64,
    content_hash: String,
    parent_version: i64,
    chunks: Vec<String>,
}

async fn update_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
    Json(req): Json<UpdateFileRequest>,
) -> Result<Json<FileResponse>, AppError> {
    let machine_id = auth::authenticate(&state, &headers).await?;
    let path = validate_path(&path)?;

    let file = db::files::update_file(
        &state.db,
        &path,
        req.size,
        &req.content_hash,
        req.parent_version,
        machine_id,
    )
    .await?;
    db::files::set_file_chunks(&state.db, file.id, &req.chunks).await?;

    state.hub.notify_file_change(machine_id, "UPDATED", &path).await;
    Ok(Json(file.into()))
}

async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    let machine_id = auth::authenticate(&state, &headers).await?;
    let path = validate_path(&path)?;

    let was_live = db::files::get_file(&state.db, &path)
        .await?
        .map(|f| !f.is_trashed())
        .unwrap_or(false);

    db::files::delete_file(&state.db, &path, machine_id).await?;
    if was_live {
        state.hub.notify_file_change(machine_id, "DELETED", &path).await;
    }
    Ok(StatusCode::NO_CONTENT)
}
