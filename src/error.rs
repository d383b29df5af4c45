//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: HTTP-facing failures of the diagnostic API, rendered as JSON
//!   responses through actix's `ResponseError` trait
//! - **RelayError**: failures of relay commands, delivered to the originating
//!   WebSocket connection as a `session-error` event and never broadcast
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types (this is what makes `?` work)
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **thiserror**: Derives `Display` and `std::error::Error` from attributes

use crate::relay::protocol::{ErrorCode, ServerEvent};
use crate::relay::session::{ConnectionId, SessionId};
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Custom error types for the HTTP API.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Converts an `AppError` into the JSON error body every endpoint shares.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session 'room1' does not exist",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,  // 404
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Any `anyhow::Error` that reaches a handler is an internal failure.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// Failures of relay commands.
///
/// ## Propagation:
/// Errors with a wire code are sent to the originating connection only.
/// `TransportGone` and `MailboxFull` describe a failed delivery *to* someone else;
/// those are dropped quietly and never reported to anybody.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("session '{0}' does not exist")]
    SessionNotFound(SessionId),

    #[error("session '{0}' is closed")]
    SessionClosed(SessionId),

    #[error("only the host of session '{0}' may do that")]
    NotHost(SessionId),

    #[error("audio chunk of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("connection {0} is gone")]
    TransportGone(ConnectionId),

    #[error("mailbox of connection {0} is full")]
    MailboxFull(ConnectionId),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("no active session on this connection")]
    NoActiveSession,
}

impl RelayError {
    /// Wire code for errors that are reported to a client.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RelayError::SessionNotFound(_) => Some(ErrorCode::SessionNotFound),
            RelayError::SessionClosed(_) => Some(ErrorCode::SessionClosed),
            RelayError::NotHost(_) => Some(ErrorCode::NotSessionHost),
            RelayError::PayloadTooLarge { .. } => Some(ErrorCode::PayloadTooLarge),
            RelayError::InvalidMessage(_) => Some(ErrorCode::InvalidMessage),
            RelayError::NoActiveSession => Some(ErrorCode::NoActiveSession),
            RelayError::TransportGone(_) | RelayError::MailboxFull(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            RelayError::SessionNotFound(id) | RelayError::SessionClosed(id) | RelayError::NotHost(id) => Some(id),
            _ => None,
        }
    }

    /// Build the `session-error` event for this error, if it is client-facing.
    pub fn to_event(&self) -> Option<ServerEvent> {
        let code = self.code()?;
        Some(ServerEvent::SessionError {
            code,
            message: self.to_string(),
            session_id: self.session_id().cloned(),
        })
    }
}
