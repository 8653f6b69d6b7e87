//! Size and shape guards.
//!
//! Both checks are non-mutating and run before anything expensive: the byte
//! ceiling before the body is inspected at all, the structure guard right
//! after parsing and before sanitization walks the tree.

use serde_json::Value;

use crate::domain::config::LimitsConfig;
use crate::domain::error::GuardError;
use crate::validation::schema::FieldError;

/// Body classification used to pick a byte ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Multipart,
    Form,
    Text,
    Other,
}

impl ContentKind {
    /// Classify a `Content-Type` header value (parameters ignored).
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(raw) = content_type else {
            return ContentKind::Other;
        };
        let essence = raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/json" => ContentKind::Json,
            s if s.starts_with("application/") && s.ends_with("+json") => ContentKind::Json,
            "multipart/form-data" => ContentKind::Multipart,
            "application/x-www-form-urlencoded" => ContentKind::Form,
            "text/plain" => ContentKind::Text,
            _ => ContentKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Json => "json",
            ContentKind::Multipart => "multipart",
            ContentKind::Form => "form",
            ContentKind::Text => "text",
            ContentKind::Other => "default",
        }
    }

    /// Byte ceiling for this kind
    pub fn limit(self, limits: &LimitsConfig) -> usize {
        match self {
            ContentKind::Json => limits.max_json_bytes,
            ContentKind::Multipart => limits.max_multipart_bytes,
            ContentKind::Form => limits.max_form_bytes,
            ContentKind::Text => limits.max_text_bytes,
            ContentKind::Other => limits.max_default_bytes,
        }
    }
}

/// Body exceeds its byte ceiling
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payload of {size} bytes exceeds the {limit}-byte limit for {} bodies", .kind.as_str())]
pub struct PayloadError {
    pub size: usize,
    pub limit: usize,
    pub kind: ContentKind,
}

impl From<PayloadError> for GuardError {
    fn from(err: PayloadError) -> Self {
        GuardError::PayloadTooLarge {
            size: err.size,
            limit: err.limit,
            content_kind: err.kind.as_str(),
        }
    }
}

/// Reject a body larger than the ceiling for its content type.
///
/// A body of exactly the ceiling is accepted.
pub fn check_payload_size(
    body: &[u8],
    content_type: Option<&str>,
    limits: &LimitsConfig,
) -> Result<(), PayloadError> {
    let kind = ContentKind::from_content_type(content_type);
    let limit = kind.limit(limits);
    if body.len() > limit {
        return Err(PayloadError {
            size: body.len(),
            limit,
            kind,
        });
    }
    Ok(())
}

/// Parsed JSON violates a structural limit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructureError {
    #[error("nesting depth exceeds limit of {limit} at {path}")]
    TooDeep { path: String, limit: usize },

    #[error("array at {path} has {len} elements, limit is {limit}")]
    ArrayTooLong { path: String, len: usize, limit: usize },

    #[error("object at {path} has {count} keys, limit is {limit}")]
    TooManyKeys {
        path: String,
        count: usize,
        limit: usize,
    },
}

impl StructureError {
    pub fn path(&self) -> &str {
        match self {
            StructureError::TooDeep { path, .. }
            | StructureError::ArrayTooLong { path, .. }
            | StructureError::TooManyKeys { path, .. } => path,
        }
    }
}

impl From<StructureError> for GuardError {
    fn from(err: StructureError) -> Self {
        let field = FieldError::new(err.path(), err.to_string());
        GuardError::validation("Request body exceeds structural limits", vec![field])
    }
}

/// Enforce depth, array length and key count at every level.
///
/// The root container is depth 1.
pub fn check_structure(value: &Value, limits: &LimitsConfig) -> Result<(), StructureError> {
    walk(value, "$", 1, limits)
}

fn walk(value: &Value, path: &str, depth: usize, limits: &LimitsConfig) -> Result<(), StructureError> {
    match value {
        Value::Array(items) => {
            if depth > limits.max_depth {
                return Err(StructureError::TooDeep {
                    path: path.to_string(),
                    limit: limits.max_depth,
                });
            }
            if items.len() > limits.max_array_length {
                return Err(StructureError::ArrayTooLong {
                    path: path.to_string(),
                    len: items.len(),
                    limit: limits.max_array_length,
                });
            }
            for (idx, item) in items.iter().enumerate() {
                walk(item, &format!("{path}[{idx}]"), depth + 1, limits)?;
            }
        }
        Value::Object(map) => {
            if depth > limits.max_depth {
                return Err(StructureError::TooDeep {
                    path: path.to_string(),
                    limit: limits.max_depth,
                });
            }
            if map.len() > limits.max_object_keys {
                return Err(StructureError::TooManyKeys {
                    path: path.to_string(),
                    count: map.len(),
                    limit: limits.max_object_keys,
                });
            }
            for (key, item) in map {
                walk(item, &format!("{path}.{key}"), depth + 1, limits)?;
            }
        }
        _ => {}
    }
    Ok(())
}
