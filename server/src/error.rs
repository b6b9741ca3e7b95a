use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use delivery_api::{ErrorBody, ErrorCode};

/// Errors surfaced to callers of the messaging operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Malformed or disallowed request; never retried by the client.
    #[error("{1}")]
    Validation(ErrorCode, String),
    /// The sender's plan does not allow another message right now.
    #[error("message limit reached")]
    Entitlement,
    /// Persistence is unavailable; safe to retry.
    #[error("storage unavailable: {0}")]
    Storage(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        DispatchError::Validation(ErrorCode::InvalidRequest, msg.into())
    }

    pub fn not_participant() -> Self {
        DispatchError::Validation(
            ErrorCode::NotParticipant,
            "caller is not a participant of this conversation".into(),
        )
    }

    pub fn not_found(what: &str) -> Self {
        DispatchError::Validation(ErrorCode::NotFound, format!("{what} not found"))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::Validation(code, _) => *code,
            DispatchError::Entitlement => ErrorCode::MessageLimitReached,
            DispatchError::Storage(_) => ErrorCode::StorageUnavailable,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotParticipant => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::MessageLimitReached => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let message = match self {
            // internal details stay in the logs
            DispatchError::Storage(_) => "storage unavailable, retry later".to_string(),
            other => other.to_string(),
        };
        ErrorBody::new(self.code(), message)
    }
}

impl From<r2d2::Error> for DispatchError {
    fn from(e: r2d2::Error) -> Self {
        DispatchError::Storage(e.into())
    }
}

impl From<rusqlite::Error> for DispatchError {
    fn from(e: rusqlite::Error) -> Self {
        DispatchError::Storage(e.into())
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        if let DispatchError::Storage(e) = &self {
            tracing::error!(error = %e, "storage failure");
        }
        (self.status(), Json(self.body())).into_response()
    }
}
