//! handler-guard - Protection layer for serverless request handlers.
//!
//! Wraps business callbacks with payload checks, threat screening,
//! authentication, role checks, rate limiting, input validation and
//! per-service circuit breakers, and renders every outcome as a uniform JSON
//! envelope.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            HANDLER GUARD                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────────────────────────┐                       │
//! │  │   Router  POST|OPTIONS /api/functions/:name  │                       │
//! │  └─────────────────────┬────────────────────────┘                       │
//! │                        │                                                │
//! │  ┌─────────────────────┴────────────────────────┐   ┌────────────────┐  │
//! │  │              Handler Composer                │──►│  Rate Limiter  │  │
//! │  │  size → threats → auth → roles → rate →      │   └────────────────┘  │
//! │  │  parse/sanitize/schema → callback            │   ┌────────────────┐  │
//! │  └─────────────────────┬────────────────────────┘──►│   Validation   │  │
//! │                        │                            └────────────────┘  │
//! │  ┌─────────────────────┴────────────────────────┐                       │
//! │  │     Circuit Breaker Registry (per service)   │                       │
//! │  └─────────────────────┬────────────────────────┘                       │
//! └────────────────────────┼────────────────────────────────────────────────┘
//!                          │
//!                   Business callback
//!                          │
//!     ┌────────────────────┼──────────────────────┐
//!     ▼                    ▼                      ▼
//!  database           cloud APIs            notification
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use handler_guard::{FunctionRegistry, GuardConfig, GuardService, RouteSpec};
//!
//! let functions = FunctionRegistry::new()
//!     .register(RouteSpec::new("getReport").dependency("cost-explorer"), get_report);
//! let mut service = GuardService::new(GuardConfig::default(), db, authenticator, functions)?;
//! service.serve("0.0.0.0:8080".parse()?).await?;
//! ```
//!
//! # Security
//!
//! - Payload ceilings per content type, depth and cardinality limits
//! - Threat detection on the raw body before any parser runs
//! - Multi-pass sanitization of every string value
//! - Fixed-window and tiered rate limiting with escalating blocks
//! - Constant-time API key comparison

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod domain;
pub mod middleware;
pub mod router;
pub mod service;
pub mod telemetry;
pub mod validation;

// Re-exports for public API
pub use domain::config::GuardConfig;
pub use domain::error::{GuardError, GuardResult};
pub use domain::{Clock, InboundRequest, ManualClock, Principal, SharedClock, SystemClock};
pub use middleware::{
    ApiKeyAuthenticator, Authenticator, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitState, GuardResponse, HandlerComposer, HandlerContext,
    OperationClass, RateLimiter, RouteSpec,
};
pub use router::{build_router, FunctionRegistry};
pub use service::{GuardService, ServiceError};
pub use telemetry::init_tracing;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
