//! Protection stages and the composer that runs them.
//!
//! Stage order: Preflight → PayloadSize → ThreatScan → Auth → Roles → RateLimit → Input → Handler
//!
//! ## Circuit Breaker
//!
//! The circuit breaker stops calls to a downstream dependency once it keeps
//! failing, and rejects (or serves a fallback) until the dependency has had
//! time to recover. Breakers are kept per service name in a registry owned by
//! the composer.

pub mod auth;
pub mod breaker_registry;
pub mod circuit_breaker;
pub mod composer;
pub mod cors;
pub mod metrics;
pub mod rate_limit;
pub mod tracing;

pub use auth::{authorize, constant_time_compare, ApiKeyAuthenticator, Authenticator};
pub use breaker_registry::{generic_defaults, service_defaults, CircuitBreakerRegistry};
pub use circuit_breaker::{
    static_fallback, BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics,
    CircuitState, FallbackFn, StateObserver,
};
pub use composer::{GuardResponse, HandlerComposer, HandlerContext, HealthSnapshot, RouteSpec};
pub use cors::{apply_cors, apply_preflight, apply_security_headers, negotiate_origin};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use rate_limit::{rate_limit_key, sweep_task, OperationClass, RateDecision, RateLimiter};
pub use self::tracing::RequestTrace;
