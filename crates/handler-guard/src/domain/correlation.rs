//! Request and correlation identifiers.
//!
//! Generated identifiers use UUID v7 (time-ordered). Caller-supplied values
//! are accepted when they are short and made of token characters only, so a
//! header can never smuggle arbitrary text into logs or response headers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest caller-supplied identifier accepted.
pub const MAX_ID_LEN: usize = 128;

macro_rules! trace_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a new identifier (UUID v7)
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Accept a caller-supplied value if it is a safe token.
            pub fn parse(raw: &str) -> Option<Self> {
                let raw = raw.trim();
                is_safe_token(raw).then(|| Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

trace_identifier!(
    /// Identifies one invocation.
    RequestId
);

trace_identifier!(
    /// Ties together every request made on behalf of one user action.
    CorrelationId
);

fn is_safe_token(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Extract the trace id from a W3C `traceparent` header value.
///
/// Format: `version-trace_id-parent_id-trace_flags`.
pub fn trace_id_from_traceparent(traceparent: &str) -> Option<&str> {
    let parts: Vec<&str> = traceparent.trim().split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    let trace_id = parts[1];
    if trace_id.len() != 32 || !trace_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(trace_id)
}
