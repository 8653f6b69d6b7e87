//! JSON Schema validation for request bodies.
//!
//! A route's schema is a JSON Schema document compiled once when the route is
//! declared. Validation runs after the structural guard has bounded depth and
//! cardinality, and collects every violation instead of stopping at the first
//! so clients can fix all fields in one round trip.
//!
//! Violations are reported with dotted field paths (`items[2].sku`) rather
//! than JSON pointers; the root itself is `$`.

use jsonschema::error::ValidationErrorKind;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// One field-level violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Dotted path, e.g. `items[2].sku`
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a value against a schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid(Vec<FieldError>),
}

impl ValidationOutcome {
    fn from_errors(errors: Vec<FieldError>) -> Self {
        if errors.is_empty() {
            ValidationOutcome::Valid
        } else {
            ValidationOutcome::Invalid(errors)
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }

    pub fn errors(&self) -> &[FieldError] {
        match self {
            ValidationOutcome::Valid => &[],
            ValidationOutcome::Invalid(errors) => errors,
        }
    }

    pub fn into_result(self) -> Result<(), Vec<FieldError>> {
        match self {
            ValidationOutcome::Valid => Ok(()),
            ValidationOutcome::Invalid(errors) => Err(errors),
        }
    }
}

/// The schema document could not be compiled
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid JSON schema: {message}")]
    InvalidSchema { message: String },
}

/// Compiled JSON Schema for one route's request body
#[derive(Debug)]
pub struct RouteSchema {
    validator: jsonschema::Validator,
}

impl RouteSchema {
    /// Compile a schema document.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidSchema`] if `document` is not a valid
    /// JSON Schema.
    pub fn new(document: &Value) -> Result<Self, SchemaError> {
        let validator =
            jsonschema::validator_for(document).map_err(|e| SchemaError::InvalidSchema {
                message: e.to_string(),
            })?;
        Ok(Self { validator })
    }

    pub fn validate(&self, value: &Value) -> ValidationOutcome {
        if self.validator.is_valid(value) {
            return ValidationOutcome::Valid;
        }

        let mut errors = Vec::new();
        for error in self.validator.iter_errors(value) {
            let path = field_path(value, &error.instance_path.to_string());
            match &error.kind {
                ValidationErrorKind::Required { property } => {
                    let name = property.as_str().unwrap_or_default();
                    errors.push(FieldError::new(join(&path, name), "is required"));
                }
                ValidationErrorKind::AdditionalProperties { unexpected }
                | ValidationErrorKind::UnevaluatedProperties { unexpected } => {
                    for name in unexpected {
                        errors.push(FieldError::new(join(&path, name), "is not an allowed field"));
                    }
                }
                _ => errors.push(FieldError::new(display_root(&path), error.to_string())),
            }
        }
        ValidationOutcome::from_errors(errors)
    }
}

/// Convert a JSON pointer into a dotted path, using the instance to tell
/// array indices from numeric object keys.
fn field_path(instance: &Value, pointer: &str) -> String {
    let mut path = String::new();
    let mut current = Some(instance);

    for raw in pointer.split('/').skip(1) {
        let segment = raw.replace("~1", "/").replace("~0", "~");
        match current {
            Some(Value::Array(items)) => {
                path.push_str(&format!("[{segment}]"));
                current = segment.parse::<usize>().ok().and_then(|idx| items.get(idx));
            }
            other => {
                path = join(&path, &segment);
                current = match other {
                    Some(Value::Object(map)) => map.get(&segment),
                    _ => None,
                };
            }
        }
    }
    path
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn display_root(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}
