use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use sqlx::migrate::MigrateError;
use serde::Serialize;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized")]
    Unauthorized,
}

/// Payment gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unexpected gateway response: {0}")]
    Decode(String),

    /// Refused locally before anything was sent
    #[error("Invalid gateway request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// True when the gateway explicitly refused the request, so nothing was
    /// moved. Transport errors, 5xx and undecodable replies leave the outcome
    /// unknown.
    pub fn is_definitive(&self) -> bool {
        match self {
            GatewayError::Rejected { status, .. } => (400..500).contains(status),
            GatewayError::InvalidRequest(_) => true,
            GatewayError::Http(_) | GatewayError::Decode(_) => false,
        }
    }
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub timestamp: DateTime<Utc>,
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            AppError::InsufficientBalance { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_BALANCE")
            }
            AppError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            AppError::Gateway(_) => (StatusCode::BAD_GATEWAY, "GATEWAY_ERROR"),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        let body = Json(ErrorResponse {
            success: false,
            error: self.to_string(),
            error_code: error_code.to_string(),
            timestamp: Utc::now(),
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
