//! # Error Handling
//!
//! Two error families live here:
//!
//! - **ConsultError**: the live-consultation core taxonomy. Device and transport
//!   open failures surface as a session transition to `Error`; per-frame failures
//!   (decode, send) are absorbed locally so the real-time stream keeps flowing.
//! - **AppError**: the HTTP surface. Converts failures into consistent JSON error
//!   responses via actix's `ResponseError` trait.
//!
//! ## Propagation policy:
//! Only device and transport-open errors are user-visible (they show up as the
//! connection status). A malformed inbound frame or a failed outbound send costs
//! one frame, never the session: a live audio exchange favors continuity over
//! completeness.

use crate::audio::codec::DecodeError;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failures of the live-consultation core.
#[derive(Debug)]
pub enum ConsultError {
    /// Microphone or speaker context unavailable/denied. No retry; the session
    /// moves to Error until a new user-initiated start.
    Device(String),

    /// The remote live session failed to open. Same policy as Device.
    TransportOpen(String),

    /// Malformed inbound payload. Recovered locally: the frame is dropped and
    /// the session stays Connected.
    FrameDecode(DecodeError),

    /// An outbound frame could not be delivered. Recovered locally: the frame
    /// is dropped and capture continues.
    SendFailure(String),
}

impl fmt::Display for ConsultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsultError::Device(msg) => write!(f, "audio device error: {}", msg),
            ConsultError::TransportOpen(msg) => write!(f, "remote session open failed: {}", msg),
            ConsultError::FrameDecode(err) => write!(f, "inbound frame decode failed: {}", err),
            ConsultError::SendFailure(msg) => write!(f, "outbound frame send failed: {}", msg),
        }
    }
}

impl std::error::Error for ConsultError {}

impl From<DecodeError> for ConsultError {
    fn from(err: DecodeError) -> Self {
        ConsultError::FrameDecode(err)
    }
}

/// Errors returned from HTTP handlers.
///
/// ## HTTP status mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
#[derive(Debug)]
pub enum AppError {
    /// Server-side failures (channel wiring, lock poisoning, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource does not exist
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Input failed validation rules
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

/// Converts AppError values into JSON HTTP responses.
///
/// All errors share one response shape:
/// ```json
/// { "error": { "type": "...", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

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

/// Shorthand for results on the HTTP surface.
pub type AppResult<T> = Result<T, AppError>;
