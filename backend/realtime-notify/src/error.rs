use crate::broker::ConnectionId;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

pub type AppResult<T> = std::result::Result<T, AppError>;

/// Errors surfaced by the broker core
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection id already registered; points at an id-generation bug
    #[error("duplicate connection: {0}")]
    DuplicateConnection(ConnectionId),
}

/// Sink write failure. Contained to the failing connection's teardown.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("sink closed")]
    Closed,

    #[error("sink write timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    /// Client fell behind and its outbound queue filled up
    #[error("outbound queue full")]
    QueueFull,
}

/// Errors surfaced by the HTTP host
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Broker(BrokerError::DuplicateConnection(_)) => "DUPLICATE_CONNECTION",
            AppError::Internal => "INTERNAL_ERROR",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Config(_) | AppError::Broker(_) | AppError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}
