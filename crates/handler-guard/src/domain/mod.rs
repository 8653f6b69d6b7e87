//! Domain types for the guard.
//!
//! Configuration, the error taxonomy, identifiers, the response envelope,
//! the request view and the time source.

pub mod clock;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod principal;
pub mod request;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Environment, GuardConfig, LimitsConfig, RatePolicy};
pub use correlation::{CorrelationId, RequestId};
pub use envelope::{FailureEnvelope, SuccessEnvelope};
pub use error::{GuardError, GuardResult};
pub use principal::Principal;
pub use request::{extract_client_ip, InboundRequest};
