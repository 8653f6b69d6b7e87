//! Request identity and span creation.
//!
//! Every composed request carries a request id (one invocation) and a
//! correlation id (one user action across calls). Both are taken from the
//! caller when present and safe, otherwise generated. A W3C `traceparent`
//! header supplies the correlation id when no explicit one is sent.

use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tracing::{info_span, Span};

use crate::domain::correlation::{trace_id_from_traceparent, CorrelationId, RequestId};
use crate::domain::request::InboundRequest;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");
pub const RESPONSE_TIME_HEADER: HeaderName = HeaderName::from_static("x-response-time");

/// Identity and timing for one request
#[derive(Debug, Clone)]
pub struct RequestTrace {
    pub request_id: RequestId,
    pub correlation_id: CorrelationId,
    /// Trace id from `traceparent`, if the caller sent one
    pub parent_trace_id: Option<String>,
    started: Instant,
}

impl RequestTrace {
    /// Resolve ids from request headers, generating what is missing.
    pub fn from_request(request: &InboundRequest) -> Self {
        let request_id = request
            .header(&REQUEST_ID_HEADER)
            .and_then(RequestId::parse)
            .unwrap_or_default();

        let parent_trace_id = request
            .header("traceparent")
            .and_then(trace_id_from_traceparent)
            .map(str::to_string);

        let correlation_id = request
            .header(&CORRELATION_ID_HEADER)
            .and_then(CorrelationId::parse)
            .or_else(|| parent_trace_id.as_deref().and_then(CorrelationId::parse))
            .unwrap_or_default();

        Self {
            request_id,
            correlation_id,
            parent_trace_id,
            started: Instant::now(),
        }
    }

    /// Span wrapping the whole guarded request
    pub fn span(&self, request: &InboundRequest) -> Span {
        info_span!(
            "guarded_request",
            http.method = %request.method,
            function = %request.function,
            request_id = %self.request_id,
            correlation_id = %self.correlation_id,
            trace_id = self.parent_trace_id.as_deref().unwrap_or(""),
        )
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Add `X-Request-ID`, `X-Correlation-ID` and `X-Response-Time`
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(self.request_id.as_str()) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(self.correlation_id.as_str()) {
            headers.insert(CORRELATION_ID_HEADER, value);
        }
        let millis = self.elapsed().as_millis();
        if let Ok(value) = HeaderValue::from_str(&format!("{millis}ms")) {
            headers.insert(RESPONSE_TIME_HEADER, value);
        }
    }
}
