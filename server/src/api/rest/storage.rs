//! Opaque chunk blob storage (§6.1 `/api/storage/chunks/{hash}`, C2).
//!
//! The server never validates that `bytes` hashes back to `hash` — that
//! check only makes sense after client-side decryption (§4.2).

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Router,
};

use super::error::AppError;
use crate::api::AppState;
use crate::auth;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/api/storage/chunks/:hash",
        put(upload_chunk).get(download_chunk).head(head_chunk).delete(remove_chunk),
    )
}

async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hash): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    auth::authenticate(&state, &headers).await?;

    if body.is_empty() {
        return Err(AppError::BadRequest("chunk body must not be empty".to_string()));
    }

    // Idempotent: re-uploading a hash that already exists is a no-op at the
    // blob level (§4.4).
    if !state.blob_store.exists(&hash)? {
        state.blob_store.write(&hash, &body)?;
    }

    Ok(StatusCode::CREATED)
}

async fn download_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    auth::authenticate(&state, &headers).await?;
    let bytes = state.blob_store.read(&hash)?;
    Ok(Body::from(bytes))
}

async fn head_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hash): Path<String>,
) -> Result<StatusCode, AppError> {
    auth::authenticate(&state, &headers).await?;
    if state.blob_store.exists(&hash)? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn remove_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(hash): Path<String>,
) -> Result<StatusCode, AppError> {
    auth::authenticate(&state, &headers).await?;
    if !state.blob_store.exists(&hash)? {
        return Err(AppError::NotFound(format!("chunk not found: {hash}")));
    }
    state.blob_store.delete(&hash)?;
    Ok(StatusCode::NO_CONTENT)
}
