//! Error taxonomy for request-path operations
//!
//! Every fallible operation exposed to a caller returns `ApiError`, so the
//! kind is distinguishable programmatically. `Store` is the only server-fault
//! class; everything else is caller-correctable.

use crate::models::ErrorResponse;
use axum::{http::StatusCode, response::IntoResponse, Json};

#[derive(Debug)]
pub enum ApiError {
    /// Missing or malformed required field
    Validation(String),
    /// Unknown receiver, message, or file
    NotFound(String),
    /// File access by a non-participant
    AccessDenied(String),
    /// Registration collides with an existing user_id, username, or email
    DuplicateIdentity(String),
    /// Single-file or per-user storage cap breached
    QuotaExceeded(String),
    /// File extension not in the allow-list
    TypeNotAllowed(String),
    /// Missing, unknown, or inactive API key
    Unauthenticated(String),
    /// Underlying durability failure
    Store(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ApiError::DuplicateIdentity(_) => StatusCode::CONFLICT,
            ApiError::QuotaExceeded(_) => StatusCode::BAD_REQUEST,
            ApiError::TypeNotAllowed(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Validation(msg)
            | ApiError::NotFound(msg)
            | ApiError::AccessDenied(msg)
            | ApiError::DuplicateIdentity(msg)
            | ApiError::QuotaExceeded(msg)
            | ApiError::TypeNotAllowed(msg)
            | ApiError::Unauthenticated(msg) => write!(f, "{}", msg),
            ApiError::Store(err) => write!(f, "Storage error: {}", err),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Store(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Store(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
