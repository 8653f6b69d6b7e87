//! Request counters for the health endpoint.
//!
//! Plain atomics; a [`MetricsSnapshot`] is what gets serialized.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::domain::error::GuardError;

/// Guard-wide counters
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub requests_total: AtomicU64,
    pub requests_success: AtomicU64,
    pub requests_error: AtomicU64,
    pub preflight_total: AtomicU64,

    // Rejections by stage
    pub payload_rejected: AtomicU64,
    pub malicious_rejected: AtomicU64,
    pub auth_rejected: AtomicU64,
    pub forbidden_rejected: AtomicU64,
    pub rate_limit_rejected: AtomicU64,
    pub validation_rejected: AtomicU64,
    pub circuit_open_rejected: AtomicU64,

    total_latency_ms: AtomicU64,
    request_count_for_latency: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished request
    pub fn record_request(&self, success: bool, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.request_count_for_latency.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preflight(&self) {
        self.preflight_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump the stage counter matching `error`
    pub fn record_rejection(&self, error: &GuardError) {
        let counter = match error {
            GuardError::PayloadTooLarge { .. } => &self.payload_rejected,
            GuardError::MaliciousContent { .. } => &self.malicious_rejected,
            GuardError::Unauthenticated => &self.auth_rejected,
            GuardError::Forbidden { .. } => &self.forbidden_rejected,
            GuardError::RateLimited { .. } => &self.rate_limit_rejected,
            GuardError::Validation { .. } => &self.validation_rejected,
            GuardError::CircuitOpen { .. } => &self.circuit_open_rejected,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get average latency in ms
    pub fn average_latency_ms(&self) -> f64 {
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        let count = self.request_count_for_latency.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests: RequestCounts {
                total: load(&self.requests_total),
                success: load(&self.requests_success),
                error: load(&self.requests_error),
                preflight: load(&self.preflight_total),
            },
            rejections: RejectionCounts {
                payload: load(&self.payload_rejected),
                malicious: load(&self.malicious_rejected),
                unauthenticated: load(&self.auth_rejected),
                forbidden: load(&self.forbidden_rejected),
                rate_limited: load(&self.rate_limit_rejected),
                validation: load(&self.validation_rejected),
                circuit_open: load(&self.circuit_open_rejected),
            },
            average_latency_ms: self.average_latency_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestCounts,
    pub rejections: RejectionCounts,
    pub average_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestCounts {
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub preflight: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectionCounts {
    pub payload: u64,
    pub malicious: u64,
    pub unauthenticated: u64,
    pub forbidden: u64,
    pub rate_limited: u64,
    pub validation: u64,
    pub circuit_open: u64,
}
