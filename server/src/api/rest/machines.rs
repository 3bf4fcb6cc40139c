//! Machine registration and management (§6.1 `/api/machines*`).

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::error::AppError;
use super::types::MachineResponse;
use crate::api::AppState;
use crate::auth::{self, hash_token};
use crate::db;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/machines", get(list_machines))
        .route("/api/machines/:id", delete(remove_machine))
}

/// `POST /api/machines/register` on its own router so the per-IP rate
/// limiter in `rest::mod` can be layered onto just this unauthenticated,
/// invitation-consuming route.
pub fn register_routes() -> Router<AppState> {
    Router::new().route("/api/machines/register", post(register_machine))
}

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    platform: String,
    invitation_token: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    token: String,
    machine: MachineResponse,
}

async fn register_machine(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let invitation_hash = hash_token(&req.invitation_token);

    if let Some(existing) = db::machines::get_machine_by_name(&state.db, &req.name).await? {
        let _ = existing;
        return Err(AppError::Conflict(format!("machine name already registered: {}", req.name)));
    }

    let machine = db::machines::create_machine(&state.db, &req.name, &req.platform, false).await?;

    let consumed = db::tokens::consume_invitation(&state.db, &invitation_hash, machine.id).await?;
    if consumed.is_none() {
        // Roll back the machine row: an invalid/already-used invitation
        // must not leave a registered machine with no valid credential.
        let _ = db::tokens::revoke_all_for_machine(&state.db, machine.id).await;
        sqlx::query("DELETE FROM machines WHERE id = ?")
            .bind(machine.id)
            .execute(&state.db)
            .await
            .ok();
        return Err(AppError::Unauthorized("invalid or already-used invitation".to_string()));
    }

    let (raw_token, token_hash) = auth::generate_token();
    db::tokens::create_token(&state.db, machine.id, &token_hash, None).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            token: raw_token,
            machine: machine.into(),
        }),
    ))
}

async fn list_machines(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<MachineResponse>>, AppError> {
    auth::authenticate(&state, &headers).await?;

    let machines = db::machines::list_machines(&state.db)
        .await?
        .into_iter()
        .filter(|m| !m.is_server_machine)
        .map(MachineResponse::from)
        .collect();
    Ok(Json(machines))
}

async fn remove_machine(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<axum::http::StatusCode, AppError> {
    auth::authenticate(&state, &headers).await?;

    let machine = db::machines::get_machine(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("machine {id}")))?;

    if machine.is_server_machine {
        return Err(AppError::Forbidden("cannot remove the reserved server machine".to_string()));
    }

    db::tokens::revoke_all_for_machine(&state.db, id).await?;
    sqlx::query("DELETE FROM machines WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await?;

    Ok(axum::http::StatusCode::NO_CONTENT)
}
