use crate::models::{ConnectionId, Room};
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Why a send into a connection's outbound queue did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Queue is full; the client is not draining fast enough.
    Backpressure,
    /// Receiver side is gone; the socket actor already stopped.
    Closed,
}

impl DeliveryFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryFailure::Backpressure => "backpressure",
            DeliveryFailure::Closed => "closed",
        }
    }
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the fan-out core and the gateway.
///
/// None of these is fatal to the process: each one concerns a single
/// connection, a single intent or a single handshake.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RealtimeError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("not authorized for room {room}")]
    AuthorizationViolation { room: Room },

    #[error("delivery to connection {connection_id} failed: {reason}")]
    TransientDeliveryFailure {
        connection_id: ConnectionId,
        reason: DeliveryFailure,
    },

    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("membership store error: {0}")]
    MembershipStore(String),

    #[error("invalid room: {0}")]
    InvalidRoom(String),

    #[error("realtime hub is shutting down")]
    ShuttingDown,
}

impl RealtimeError {
    /// Stable machine-readable code, sent to clients in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::AuthenticationFailure(_) => "authentication_failure",
            RealtimeError::AuthorizationViolation { .. } => "authorization_violation",
            RealtimeError::TransientDeliveryFailure { .. } => "transient_delivery_failure",
            RealtimeError::DuplicateConnection(_) => "duplicate_connection",
            RealtimeError::HandshakeTimeout => "handshake_timeout",
            RealtimeError::MembershipStore(_) => "membership_unavailable",
            RealtimeError::InvalidRoom(_) => "invalid_room",
            RealtimeError::ShuttingDown => "shutting_down",
        }
    }
}

impl From<sqlx::Error> for RealtimeError {
    fn from(e: sqlx::Error) -> Self {
        RealtimeError::MembershipStore(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    /// Returns whether this error is retryable (e.g., database connection timeout)
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(msg) => {
                msg.contains("PoolTimedOut") || msg.contains("PoolClosed") || msg.contains("Io")
            }
            AppError::ServiceUnavailable(_) | AppError::Internal => true,
            _ => false,
        }
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::NotFound => 404,
            AppError::ServiceUnavailable(_) => 503,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Internal => 500,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::StartServer(_) => "start_failure",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::Database(_) => "database_error",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Internal => "internal_error",
        }
    }
}

impl From<RealtimeError> for AppError {
    fn from(e: RealtimeError) -> Self {
        match e {
            RealtimeError::AuthenticationFailure(_) | RealtimeError::HandshakeTimeout => {
                AppError::Unauthorized
            }
            RealtimeError::AuthorizationViolation { .. } => AppError::Forbidden,
            RealtimeError::InvalidRoom(msg) => AppError::BadRequest(msg),
            RealtimeError::MembershipStore(msg) => AppError::ServiceUnavailable(msg),
            RealtimeError::ShuttingDown => {
                AppError::ServiceUnavailable("realtime hub is shutting down".into())
            }
            RealtimeError::DuplicateConnection(_) | RealtimeError::TransientDeliveryFailure { .. } => {
                AppError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        // Internal details stay in the logs.
        let message = match self {
            AppError::Config(_) | AppError::StartServer(_) | AppError::Database(_) => {
                tracing::error!(error = %self, "request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        HttpResponse::build(ResponseError::status_code(self)).json(json!({
            "error": message,
            "code": self.code(),
        }))
    }
}
