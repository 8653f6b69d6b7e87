//! # handler-guard Test Suite
//!
//! Cross-module flows that exercise the composer, limiter, breakers and
//! router together.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── breaker_flows.rs      # Trip, fallback, recovery through the registry
//!     ├── rate_limit_flows.rs   # Tier composition and escalation
//!     └── request_flows.rs      # Pre-parse screening, CORS on every response
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p guard-tests
//! cargo test -p guard-tests integration::request_flows
//! ```

#![allow(unused_variables)]
#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
