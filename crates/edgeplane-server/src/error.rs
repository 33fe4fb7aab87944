//! HTTP error types for the control plane server.
//!
//! Maps domain errors from `edgeplane-core`/`edgeplane-storage` into HTTP
//! responses at a single point (`spec.md` §7). Every variant produces a
//! JSON body with a machine-readable `error` field.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use edgeplane_core::error::{CrlError, EnrollmentError, HeartbeatError, PlanEngineError};
use edgeplane_storage::RepoError;
use serde::Serialize;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// Too many requests; the caller should retry after the given number of
    /// seconds (`spec.md` §6: `Retry-After: 60`).
    RateLimited { endpoint: String, retry_after_secs: u64 },
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, None),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            Self::RateLimited {
                endpoint,
                retry_after_secs,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("rate limit exceeded for endpoint '{endpoint}'"),
                Some(retry_after_secs),
            ),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        let mut response = (status, axum::Json(ErrorBody { error: message })).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(msg) => Self::NotFound(msg),
            RepoError::Conflict(msg) => Self::Conflict(msg),
            RepoError::Unauthorized(msg) => Self::Unauthorized(msg),
            RepoError::InvalidInput(msg) => Self::BadRequest(msg),
            RepoError::Backend(msg) => Self::Internal(msg),
        }
    }
}

impl From<PlanEngineError> for AppError {
    fn from(err: PlanEngineError) -> Self {
        match err {
            PlanEngineError::Validation(msg) => Self::BadRequest(msg),
            PlanEngineError::Repo(e) => e.into(),
        }
    }
}

impl From<HeartbeatError> for AppError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::CertRevoked => {
                Self::Unauthorized("certificate has been revoked".to_owned())
            }
            HeartbeatError::Repo(e) => e.into(),
        }
    }
}

impl From<EnrollmentError> for AppError {
    fn from(err: EnrollmentError) -> Self {
        match err {
            EnrollmentError::InvalidToken(msg) => Self::Unauthorized(msg),
            EnrollmentError::AlreadyEnrolled => {
                Self::Conflict("host is already enrolled".to_owned())
            }
            EnrollmentError::InvalidRefreshToken => {
                Self::Unauthorized("refresh token invalid".to_owned())
            }
            EnrollmentError::Pki(msg) => Self::Internal(msg),
            EnrollmentError::Repo(e) => e.into(),
        }
    }
}

impl From<CrlError> for AppError {
    fn from(err: CrlError) -> Self {
        match err {
            CrlError::Signing(msg) => Self::Internal(msg),
            CrlError::Repo(e) => e.into(),
        }
    }
}
