//! Request validation and sanitization.
//!
//! Four independent pieces, each usable on its own:
//!
//! - [`payload`]: byte ceilings per content type and structural limits
//!   (non-mutating, runs first)
//! - [`detect`]: malicious-pattern detection on a normalized copy
//!   (non-mutating, runs on the raw body before parsing)
//! - [`sanitize`]: idempotent string cleaning (mutating)
//! - [`schema`]: JSON Schema validation with field-level errors
//!
//! [`normalize`] holds the decode passes shared by detection and sanitation.

pub mod detect;
pub mod normalize;
pub mod payload;
pub mod sanitize;
pub mod schema;

pub use detect::{detect_threats, is_malicious, ThreatCategory};
pub use payload::{check_payload_size, check_structure, ContentKind, PayloadError, StructureError};
pub use sanitize::{sanitize_string, sanitize_value};
pub use schema::{FieldError, RouteSchema, SchemaError, ValidationOutcome};
