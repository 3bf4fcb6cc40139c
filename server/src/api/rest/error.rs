//! Error handling shared by every REST endpoint: the `AppError` → HTTP
//! status mapping, and path validation (forward-slash-separated, relative
//! to the sync root, per §3's File record invariant).

use crate::db::files::FileError;
use crate::storage::BlobError;
use axum::{http::StatusCode, response::IntoResponse, Json};

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => {
                tracing::error!(details = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<crate::auth::AuthError> for AppError {
    fn from(err: crate::auth::AuthError) -> Self {
        match err {
            crate::auth::AuthError::MissingToken | crate::auth::AuthError::InvalidToken => {
                AppError::Unauthorized("invalid or missing bearer token".to_string())
            }
            crate::auth::AuthError::Internal => AppError::Internal("token validation failed".to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<FileError> for AppError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::NotFound(path) => AppError::NotFound(format!("file not found: {path}")),
            FileError::Conflict { path, expected, actual } => AppError::Conflict(format!(
                "version conflict on {path}: expected parent version {expected}, server has {actual}"
            )),
            FileError::AlreadyExists(path) => AppError::Conflict(format!("path already exists: {path}")),
            FileError::Db(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(hash) => AppError::NotFound(format!("chunk not found: {hash}")),
            BlobError::InvalidHash(hash) => AppError::BadRequest(format!("invalid chunk hash: {hash}")),
            BlobError::Io(e) => AppError::Internal(e.to_string()),
        }
    }
}

/// Validate and normalize a client-supplied file path. Paths are relative to
/// the sync root, forward-slash-separated, and must not escape it.
pub fn validate_path(path: &str) -> Result<String, AppError> {
    if path.is_empty() {
        return Err(AppError::BadRequest("path cannot be empty".into()));
    }
    if path.contains('\0') {
        return Err(AppError::BadRequest("path contains a null byte".into()));
    }
    if path.contains('\\') {
        return Err(AppError::BadRequest("path must use forward slashes".into()));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(AppError::BadRequest("path contains a control character".into()));
    }

    let trimmed = path.trim_start_matches('/');
    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(AppError::BadRequest("path escapes the sync root".into())),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(AppError::BadRequest("path cannot be empty".into()));
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_relative_paths() {
        assert_eq!(validate_path("docs/notes.txt").unwrap(), "docs/notes.txt");
        assert_eq!(validate_path("hello.txt").unwrap(), "hello.txt");
    }

    #[test]
    fn normalizes_leading_slash_and_duplicate_separators() {
        assert_eq!(validate_path("/docs//notes.txt").unwrap(), "docs/notes.txt");
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("docs/../../etc").is_err());
    }

    #[test]
    fn rejects_empty_and_control_bytes() {
        assert!(validate_path("").is_err());
        assert!(validate_path("docs/\0file").is_err());
    }
}
