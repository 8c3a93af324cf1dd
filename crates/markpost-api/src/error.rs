//! Service error taxonomy and its HTTP mapping.

use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use markpost_db::StoreError;
use markpost_types::api::ErrorResponse;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Stable, client-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Unauthorized,
    InvalidCredentials,
    InvalidCurrentPassword,
    SamePassword,
    NotFound,
    Conflict,
    RateLimited,
    Internal,
    ConversionFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::InvalidCredentials => "invalid_credentials",
            ErrorCode::InvalidCurrentPassword => "invalid_current_password",
            ErrorCode::SamePassword => "same_password",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Internal => "internal",
            ErrorCode::ConversionFailed => "conversion_failed",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::Validation | ErrorCode::SamePassword => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized
            | ErrorCode::InvalidCredentials
            | ErrorCode::InvalidCurrentPassword => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Internal | ErrorCode::ConversionFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// What the client gets to read. Deliberately vague for anything that
    /// could leak internals or which limit was hit.
    fn public_message(self) -> &'static str {
        match self {
            ErrorCode::Validation => "Invalid request",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::InvalidCredentials => "Invalid username or password",
            ErrorCode::InvalidCurrentPassword => "Current password is incorrect",
            ErrorCode::SamePassword => "New password must differ from the current one",
            ErrorCode::NotFound => "Not found",
            ErrorCode::Conflict => "Already exists",
            ErrorCode::RateLimited => "Too many requests. Please try again later.",
            ErrorCode::Internal => "Internal server error",
            ErrorCode::ConversionFailed => "Failed to render content",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every business-logic failure leaves the service layer as one of these.
/// `message` is for logs; validation messages are also shown to clients.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn rate_limited() -> Self {
        Self::new(ErrorCode::RateLimited, "rate limit exceeded")
    }

    /// Wraps a store failure, keeping `NotFound` visible to the caller.
    pub fn from_store(context: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::not_found(format!("{}: not found", context)),
            StoreError::UniqueViolation(what) => {
                Self::new(ErrorCode::Conflict, format!("{}: duplicate {}", context, what))
            }
            other => Self::internal(format!("{}: {}", context, other)),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let message = match self.code {
            ErrorCode::Validation => self.message.clone(),
            ErrorCode::Internal | ErrorCode::ConversionFailed => {
                error!("{}", self);
                self.code.public_message().to_string()
            }
            code => code.public_message().to_string(),
        };
        let body = Json(ErrorResponse {
            error: self.code.as_str().to_string(),
            message,
        });
        (self.code.status(), body).into_response()
    }
}

/// Runs blocking work (Argon2, SQLite) off the async runtime.
pub async fn run_blocking<F, T>(f: F) -> ServiceResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::internal(format!("spawn_blocking join error: {}", e)))?
}
