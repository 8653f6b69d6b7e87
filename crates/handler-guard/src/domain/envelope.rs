//! Uniform JSON response envelope.
//!
//! Success: `{ "success": true, "data": ..., "timestamp": "<RFC 3339>" }`
//! Failure: `{ "success": false, "error": "...", "code": "...", "timestamp": "...", "details"?: ... }`

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::config::Environment;
use crate::domain::error::GuardError;

/// Success envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    pub success: bool,
    pub data: T,
    pub timestamp: String,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(data: T, at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            data,
            timestamp: iso8601(at),
        }
    }
}

/// Failure envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEnvelope {
    pub success: bool,
    pub error: String,
    pub code: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl FailureEnvelope {
    pub fn from_error(error: &GuardError, environment: Environment, at: DateTime<Utc>) -> Self {
        Self {
            success: false,
            error: error.client_message(environment),
            code: error.code().to_string(),
            timestamp: iso8601(at),
            details: error.details(environment),
        }
    }
}

fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
