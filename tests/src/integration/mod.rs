//! Integration flows across guard modules.

pub mod breaker_flows;
pub mod rate_limit_flows;
pub mod request_flows;
