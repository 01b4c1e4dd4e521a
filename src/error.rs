use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// key: quota-errors -> engine taxonomy
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("insufficient quota")]
    InsufficientQuota,
    #[error("timed out waiting for the balance lock on instance {0}")]
    LockTimeout(i64),
    #[error("{0} {1} not found")]
    NotFound(&'static str, i64),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl QuotaError {
    pub fn validation(message: impl Into<String>) -> Self {
        QuotaError::Validation(message.into())
    }

    /// Errors the caller may retry from scratch; nothing was applied.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QuotaError::LockTimeout(_) | QuotaError::StoreUnavailable(_) | QuotaError::Db(_)
        )
    }
}

pub type QuotaResult<T> = Result<T, QuotaError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl From<QuotaError> for AppError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Validation(message) => AppError::BadRequest(message),
            QuotaError::NotFound(..) => AppError::NotFound,
            QuotaError::InsufficientQuota => AppError::Conflict(err.to_string()),
            QuotaError::LockTimeout(_) | QuotaError::StoreUnavailable(_) => {
                AppError::Unavailable(err.to_string())
            }
            QuotaError::Db(inner) => AppError::Db(inner),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeouts_and_store_failures_are_transient() {
        assert!(QuotaError::LockTimeout(7).is_transient());
        assert!(QuotaError::StoreUnavailable("down".into()).is_transient());
        assert!(!QuotaError::InsufficientQuota.is_transient());
        assert!(!QuotaError::validation("amount must be positive").is_transient());
    }

    #[test]
    fn quota_errors_map_to_http_statuses() {
        let cases = [
            (QuotaError::validation("bad"), StatusCode::BAD_REQUEST),
            (QuotaError::NotFound("plan", 3), StatusCode::NOT_FOUND),
            (QuotaError::InsufficientQuota, StatusCode::CONFLICT),
            (QuotaError::LockTimeout(1), StatusCode::SERVICE_UNAVAILABLE),
            (
                QuotaError::Db(sqlx::Error::PoolTimedOut),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
