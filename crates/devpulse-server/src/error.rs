use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use devpulse_shared::protocol::ErrorBody;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Wrong password. Counted against the profile's attempt counter.
    #[error("Invalid password")]
    AuthInvalid { attempts_remaining: u32 },

    /// Too many failed attempts; caller must wait out the lockout window.
    #[error("Too many failed attempts. Try again in {retry_after_seconds} seconds")]
    AuthLocked { retry_after_seconds: i64 },

    #[error("Profile not found")]
    ProfileNotFound,

    #[error("Diff not found")]
    DiffNotFound,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Internal(format!("Database error: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            // Never leak which part of verification failed.
            ApiError::AuthInvalid { attempts_remaining } => {
                let mut body = ErrorBody::new("Invalid password");
                body.attempts_remaining = Some(*attempts_remaining);
                (StatusCode::UNAUTHORIZED, body)
            }
            ApiError::AuthLocked {
                retry_after_seconds,
            } => {
                let mut body = ErrorBody::new(self.to_string());
                body.locked = Some(true);
                body.retry_after_seconds = Some(*retry_after_seconds);
                (StatusCode::TOO_MANY_REQUESTS, body)
            }
            ApiError::ProfileNotFound | ApiError::DiffNotFound => {
                (StatusCode::NOT_FOUND, ErrorBody::new(self.to_string()))
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, ErrorBody::new(self.to_string())),
            // Unexpected internal errors do surface their message; only auth
            // failures are information-hidden.
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new(self.to_string()),
            ),
        };

        (status, axum::Json(body)).into_response()
    }
}
