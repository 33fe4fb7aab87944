//! Domain error taxonomy for the control plane's core subsystems.
//!
//! Each subsystem gets its own error enum so callers can match on failure
//! kind without reaching through a single catch-all; `edgeplane-server`
//! maps all of them into one HTTP-shaped `AppError` at the boundary.

use edgeplane_storage::RepoError;
use thiserror::Error;

/// Errors from `plan_engine`: `apply_plan`, `lease_pending_plans`,
/// `report_plan_result`.
#[derive(Debug, Error)]
pub enum PlanEngineError {
    /// A request referenced an operation type or payload shape the engine
    /// cannot accept.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Errors from `heartbeat`.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// The presented certificate serial is on the CRL.
    #[error("certificate revoked")]
    CertRevoked,

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Errors from `enrollment`.
#[derive(Debug, Error)]
pub enum EnrollmentError {
    #[error("enrollment token invalid: {0}")]
    InvalidToken(String),

    #[error("host already enrolled")]
    AlreadyEnrolled,

    #[error("refresh token invalid")]
    InvalidRefreshToken,

    #[error("certificate issuance failed: {0}")]
    Pki(String),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Errors from `crl`.
#[derive(Debug, Error)]
pub enum CrlError {
    #[error("CRL artifact signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Errors from `ratelimit`.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The bucket for this `(client_id, endpoint)` pair is out of tokens.
    #[error("rate limit exceeded for endpoint '{endpoint}'")]
    Exceeded { endpoint: String },
}
