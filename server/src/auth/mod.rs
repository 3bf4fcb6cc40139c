pub mod token;

pub use token::{generate_token, hash_token};

use crate::api::AppState;
use crate::db;
use axum::http::{header, HeaderMap};

/// Resolve the bearer token in `Authorization: Bearer <token>` to the
/// authenticated machine id, touching `last_seen` on success.
///
/// Every authenticated route funnels through here so `last_seen` tracking
/// (§4.4: "On any authenticated request the server updates the token's
/// machine.last_seen") happens exactly once per request, in one place.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<i64, AuthError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AuthError::MissingToken)?;

    let hash = hash_token(raw);
    let machine_id = db::tokens::validate_token(&state.db, &hash)
        .await
        .map_err(|_| AuthError::Internal)?
        .ok_or(AuthError::InvalidToken)?;

    db::machines::touch_last_seen(&state.db, machine_id)
        .await
        .map_err(|_| AuthError::Internal)?;

    Ok(machine_id)
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("internal error validating token")]
    Internal,
}
