//! Request-level error taxonomy with HTTP status mapping.
//!
//! Every stage of the composer that can reject a request produces one of these
//! kinds; `status_code`, `client_message` and `details` decide how the error is
//! rendered into the failure envelope.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::domain::config::Environment;
use crate::validation::detect::ThreatCategory;
use crate::validation::schema::FieldError;

/// Stable machine-readable codes carried in the failure envelope.
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const MALICIOUS_CONTENT: &str = "MALICIOUS_CONTENT";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const METHOD_NOT_ALLOWED: &str = "METHOD_NOT_ALLOWED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Errors rendered to clients by the composer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    /// Malformed, missing or out-of-range input.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: Vec<FieldError>,
    },

    /// Body exceeds the ceiling for its content type.
    #[error("payload too large: {size} bytes exceeds limit of {limit} bytes for {content_kind}")]
    PayloadTooLarge {
        size: usize,
        limit: usize,
        content_kind: &'static str,
    },

    /// Detection guard matched one or more threat categories.
    #[error("request contains potentially malicious content")]
    MaliciousContent { categories: Vec<ThreatCategory> },

    /// No verified principal.
    #[error("authentication required")]
    Unauthenticated,

    /// Principal lacks required role(s).
    #[error("insufficient permissions: {reason}")]
    Forbidden { reason: String },

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Downstream dependency presumed unhealthy.
    #[error("service {service} is temporarily unavailable, retry after {retry_at}")]
    CircuitOpen {
        service: String,
        retry_at: DateTime<Utc>,
    },

    /// Unknown function name.
    #[error("function not found: {0}")]
    NotFound(String),

    /// Only POST and OPTIONS are routed.
    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    /// Anything else thrown by business logic.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Validation failure with field-level detail.
    pub fn validation(message: impl Into<String>, fields: Vec<FieldError>) -> Self {
        Self::Validation {
            message: message.into(),
            fields,
        }
    }

    /// Validation failure without field detail.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::validation(message, Vec::new())
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::Internal(details.into())
    }

    /// HTTP status for this error kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::MaliciousContent { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => codes::VALIDATION_ERROR,
            Self::PayloadTooLarge { .. } => codes::PAYLOAD_TOO_LARGE,
            Self::MaliciousContent { .. } => codes::MALICIOUS_CONTENT,
            Self::Unauthenticated => codes::UNAUTHENTICATED,
            Self::Forbidden { .. } => codes::FORBIDDEN,
            Self::RateLimited { .. } => codes::RATE_LIMITED,
            Self::CircuitOpen { .. } => codes::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::MethodNotAllowed(_) => codes::METHOD_NOT_ALLOWED,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Message shown to the client.
    ///
    /// Internal errors are replaced by a generic message in production; every
    /// other kind is already safe to show.
    pub fn client_message(&self, environment: Environment) -> String {
        match self {
            Self::Validation { message, .. } => message.clone(),
            Self::Internal(_) if environment.is_production() => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Structured detail for the envelope's `details` field.
    ///
    /// Never rendered in production.
    pub fn details(&self, environment: Environment) -> Option<serde_json::Value> {
        if environment.is_production() {
            return None;
        }
        match self {
            Self::Validation { fields, .. } if !fields.is_empty() => Some(json!({
                "fields": fields,
            })),
            Self::PayloadTooLarge { size, limit, content_kind } => Some(json!({
                "size": size,
                "limit": limit,
                "content_kind": content_kind,
            })),
            Self::MaliciousContent { categories } => Some(json!({
                "categories": categories,
            })),
            Self::RateLimited { retry_after_secs } => Some(json!({
                "retry_after_secs": retry_after_secs,
            })),
            Self::CircuitOpen { service, retry_at } => Some(json!({
                "service": service,
                "retry_at": retry_at.to_rfc3339(),
            })),
            Self::Internal(detail) => Some(json!({ "internal": detail })),
            _ => None,
        }
    }

    /// Seconds for the `Retry-After` header, when the kind carries one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::CircuitOpen { retry_at, .. } => {
                let millis = (*retry_at - now).num_milliseconds().max(0) as u64;
                Some(millis.div_ceil(1000))
            }
            _ => None,
        }
    }
}

/// Result type for guarded operations
pub type GuardResult<T> = Result<T, GuardError>;
