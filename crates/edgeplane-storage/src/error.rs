//! Errors surfaced by the [`crate::Repository`] trait.

use thiserror::Error;

/// Failure modes a [`crate::Repository`] implementation can return.
///
/// This is deliberately storage-shaped, not HTTP-shaped: `edgeplane-server`
/// maps these into `AppError` at the boundary.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "postgres-backend")]
impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("resource not found".to_owned()),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                Self::Conflict(format!("unique constraint violated: {db_err}"))
            }
            other => Self::Backend(other.to_string()),
        }
    }
}
