//! Handler middleware composer.
//!
//! Applies the protection stages uniformly before a business callback runs
//! and turns every outcome into the JSON envelope.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      GUARDED REQUEST PIPELINE                        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  OPTIONS ──────────────────────────────────────────► 204 (CORS only) │
//! │                                                                      │
//! │  POST → payload size ──► threat scan ──► authenticate ──► authorize  │
//! │           (413)           (400)            (401)           (403)     │
//! │                                                              │       │
//! │         ┌────────────────────────────────────────────────────┘       │
//! │         ▼                                                            │
//! │  rate limit ──► parse + structure + sanitize + schema ──► callback   │
//! │    (429)                     (400)                  (breaker: 503)   │
//! │                                                             │        │
//! │  envelope + CORS + security headers + trace headers ◄───────┘        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stages short-circuit with their own status. Callback errors are logged in
//! full and rendered as 500 (detail withheld in production). The composer
//! never retries.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn, Instrument};

use crate::domain::clock::{system_clock, SharedClock};
use crate::domain::config::GuardConfig;
use crate::domain::correlation::{CorrelationId, RequestId};
use crate::domain::envelope::{FailureEnvelope, SuccessEnvelope};
use crate::domain::error::GuardError;
use crate::domain::principal::Principal;
use crate::domain::request::InboundRequest;
use crate::middleware::auth::{authorize, ApiKeyAuthenticator, Authenticator};
use crate::middleware::breaker_registry::CircuitBreakerRegistry;
use crate::middleware::circuit_breaker::{BreakerError, CircuitMetrics, CircuitState, FallbackFn};
use crate::middleware::cors::{apply_cors, apply_preflight, apply_security_headers};
use crate::middleware::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::middleware::rate_limit::{rate_limit_key, OperationClass, RateDecision, RateLimiter};
use crate::middleware::tracing::RequestTrace;
use crate::validation::detect::{detect_threats, excerpt};
use crate::validation::payload::{check_payload_size, check_structure};
use crate::validation::sanitize::sanitize_value;
use crate::validation::schema::RouteSchema;

/// Characters of a rejected body written to the log
const LOG_EXCERPT_CHARS: usize = 120;

/// Protection requirements of one function
#[derive(Clone)]
pub struct RouteSpec {
    pub name: String,
    /// Reject requests without a verified principal
    pub require_auth: bool,
    /// Roles the principal must all hold
    pub all_roles: Vec<String>,
    /// Roles of which the principal must hold at least one
    pub any_roles: Vec<String>,
    /// `None` disables rate limiting for the route
    pub rate_class: Option<OperationClass>,
    /// Extra sliding windows, all of which must admit the request
    pub rate_tiers: Vec<(u32, Duration)>,
    /// Compiled once, shared by every clone of the route
    pub schema: Option<Arc<RouteSchema>>,
    /// Downstream dependency guarded by a circuit breaker
    pub dependency: Option<String>,
    pub fallback: Option<FallbackFn>,
}

impl RouteSpec {
    /// Authenticated route with the default rate class.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            require_auth: true,
            all_roles: Vec::new(),
            any_roles: Vec::new(),
            rate_class: Some(OperationClass::Default),
            rate_tiers: Vec::new(),
            schema: None,
            dependency: None,
            fallback: None,
        }
    }

    pub fn public(mut self) -> Self {
        self.require_auth = false;
        self
    }

    pub fn require_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.all_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn require_any_role<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.any_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn rate_class(mut self, class: OperationClass) -> Self {
        self.rate_class = Some(class);
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.rate_class = None;
        self
    }

    /// Add a sliding window of `max_requests` per `window`
    pub fn rate_tier(mut self, max_requests: u32, window: Duration) -> Self {
        self.rate_tiers.push((max_requests, window));
        self
    }

    pub fn schema(mut self, schema: RouteSchema) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    pub fn dependency(mut self, service: impl Into<String>) -> Self {
        self.dependency = Some(service.into());
        self
    }

    pub fn fallback(mut self, fallback: FallbackFn) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl std::fmt::Debug for RouteSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSpec")
            .field("name", &self.name)
            .field("require_auth", &self.require_auth)
            .field("all_roles", &self.all_roles)
            .field("any_roles", &self.any_roles)
            .field("rate_class", &self.rate_class)
            .field("rate_tiers", &self.rate_tiers)
            .field("dependency", &self.dependency)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Context handed to the business callback
#[derive(Debug)]
pub struct HandlerContext<D> {
    pub principal: Option<Principal>,
    pub organization_id: Option<String>,
    pub request_id: RequestId,
    pub correlation_id: CorrelationId,
    /// Persistence handle
    pub db: Arc<D>,
}

/// Rendered response
#[derive(Debug, Clone)]
pub struct GuardResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// `None` for preflight responses
    pub body: Option<Value>,
}

impl GuardResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl IntoResponse for GuardResponse {
    fn into_response(self) -> Response {
        match self.body {
            Some(body) => (self.status, self.headers, Json(body)).into_response(),
            None => (self.status, self.headers).into_response(),
        }
    }
}

/// Health view: gateway counters plus every breaker
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// `ok`, or `degraded` while any breaker is not closed
    pub status: &'static str,
    pub gateway: MetricsSnapshot,
    pub breakers: Vec<CircuitMetrics>,
    pub rate_limit_entries: usize,
    pub timestamp: DateTime<Utc>,
}

/// Applies the protection stages around business callbacks.
///
/// Shared state (limiter, breakers, metrics) is injected so each
/// composition root, and each test, owns its own instances.
pub struct HandlerComposer<D> {
    config: Arc<GuardConfig>,
    authenticator: Arc<dyn Authenticator>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<GatewayMetrics>,
    db: Arc<D>,
    clock: SharedClock,
}

impl<D> HandlerComposer<D> {
    pub fn new(config: GuardConfig, db: Arc<D>) -> Self {
        Self::with_clock(config, db, system_clock())
    }

    /// Build with limiter and breakers driven by `clock`
    pub fn with_clock(config: GuardConfig, db: Arc<D>, clock: SharedClock) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit, Arc::clone(&clock)));
        let breakers = Arc::new(CircuitBreakerRegistry::from_settings(
            &config.circuit_breaker,
            Arc::clone(&clock),
        ));
        Self {
            config: Arc::new(config),
            authenticator: Arc::new(ApiKeyAuthenticator::new()),
            limiter,
            breakers,
            metrics: Arc::new(GatewayMetrics::new()),
            db,
            clock,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn health(&self) -> HealthSnapshot {
        let breakers = self.breakers.list_metrics();
        let degraded = breakers.iter().any(|m| m.state != CircuitState::Closed);
        HealthSnapshot {
            status: if degraded { "degraded" } else { "ok" },
            gateway: self.metrics.snapshot(),
            breakers,
            rate_limit_entries: self.limiter.entry_count(),
            timestamp: self.clock.now(),
        }
    }

    /// Render an error raised outside a composed call (unknown function,
    /// unsupported method, unreadable body).
    pub fn reject(&self, error: &GuardError, request: &InboundRequest) -> GuardResponse {
        let trace = RequestTrace::from_request(request);
        self.metrics.record_rejection(error);
        let response = self.failure(error);
        self.finish(response, request.origin(), &trace)
    }

    /// Run `callback` behind every protection stage.
    pub async fn handle<I, O, F, Fut>(
        &self,
        route: &RouteSpec,
        request: InboundRequest,
        callback: F,
    ) -> GuardResponse
    where
        I: DeserializeOwned,
        O: Serialize,
        F: FnOnce(I, HandlerContext<D>, InboundRequest) -> Fut,
        Fut: Future<Output = anyhow::Result<O>>,
    {
        let trace = RequestTrace::from_request(&request);
        let span = trace.span(&request);
        let origin = request.origin().map(str::to_string);

        async move {
            if request.method == Method::OPTIONS {
                self.metrics.record_preflight();
                let mut headers = HeaderMap::new();
                apply_preflight(&mut headers, &self.config.cors, origin.as_deref());
                let response = GuardResponse {
                    status: StatusCode::NO_CONTENT,
                    headers,
                    body: None,
                };
                return self.finish(response, origin.as_deref(), &trace);
            }

            let outcome = self.run_stages(route, request, callback, &trace).await;
            let latency_ms = trace.elapsed().as_millis() as u64;

            let response = match outcome {
                Ok(data) => {
                    self.metrics.record_request(true, latency_ms);
                    debug!(latency_ms, "Request completed");
                    GuardResponse {
                        status: StatusCode::OK,
                        headers: HeaderMap::new(),
                        body: Some(envelope_json(&SuccessEnvelope::new(data, self.clock.now()))),
                    }
                }
                Err(err) => {
                    self.metrics.record_request(false, latency_ms);
                    self.metrics.record_rejection(&err);
                    if !matches!(err, GuardError::Internal(_)) {
                        warn!(
                            code = err.code(),
                            status = err.status_code().as_u16(),
                            latency_ms,
                            "Request rejected: {}",
                            err
                        );
                    }
                    self.failure(&err)
                }
            };
            self.finish(response, origin.as_deref(), &trace)
        }
        .instrument(span)
        .await
    }

    async fn run_stages<I, O, F, Fut>(
        &self,
        route: &RouteSpec,
        request: InboundRequest,
        callback: F,
        trace: &RequestTrace,
    ) -> Result<Value, GuardError>
    where
        I: DeserializeOwned,
        O: Serialize,
        F: FnOnce(I, HandlerContext<D>, InboundRequest) -> Fut,
        Fut: Future<Output = anyhow::Result<O>>,
    {
        if request.method != Method::POST {
            return Err(GuardError::MethodNotAllowed(request.method.to_string()));
        }

        check_payload_size(&request.body, request.content_type(), &self.config.limits)?;

        // Screen the raw text before any parser sees it
        let raw = String::from_utf8_lossy(&request.body);
        let threats = detect_threats(&raw);
        if !threats.is_empty() {
            warn!(
                categories = ?threats,
                source_ip = ?request.source_ip,
                excerpt = %excerpt(&raw, LOG_EXCERPT_CHARS),
                "Malicious content detected"
            );
            return Err(GuardError::MaliciousContent { categories: threats });
        }

        let principal = self.authenticate(route, &request).await?;

        if !route.all_roles.is_empty() || !route.any_roles.is_empty() {
            let principal = principal.as_ref().ok_or(GuardError::Unauthenticated)?;
            authorize(
                principal,
                &route.all_roles,
                &route.any_roles,
                self.config.auth.superuser_role.as_deref(),
            )?;
        }

        self.check_rate_limit(route, principal.as_ref(), &request)?;

        let input: I = self.parse_input(route, &request.body)?;

        let ctx = HandlerContext {
            organization_id: principal.as_ref().and_then(|p| p.organization_id.clone()),
            principal,
            request_id: trace.request_id.clone(),
            correlation_id: trace.correlation_id.clone(),
            db: Arc::clone(&self.db),
        };

        let invoke = || async move {
            let output = callback(input, ctx, request).await?;
            Ok::<Value, anyhow::Error>(serde_json::to_value(output)?)
        };

        match route.dependency.as_deref() {
            Some(service) if self.config.circuit_breaker.enabled => self
                .breakers
                .with_circuit_breaker(service, invoke, route.fallback.clone())
                .await
                .map_err(|err| match err {
                    BreakerError::Open { service, retry_at } => {
                        GuardError::CircuitOpen { service, retry_at }
                    }
                    BreakerError::Fallback { service, source } => {
                        GuardError::internal(format!("fallback for {service} failed: {source}"))
                    }
                    BreakerError::Inner(e) => self.callback_failed(route, trace, e),
                }),
            _ => invoke().await.map_err(|e| self.callback_failed(route, trace, e)),
        }
    }

    async fn authenticate(
        &self,
        route: &RouteSpec,
        request: &InboundRequest,
    ) -> Result<Option<Principal>, GuardError> {
        let principal = self.authenticator.authenticate(request).await;
        if route.require_auth && principal.is_none() {
            return Err(GuardError::Unauthenticated);
        }
        Ok(principal)
    }

    fn check_rate_limit(
        &self,
        route: &RouteSpec,
        principal: Option<&Principal>,
        request: &InboundRequest,
    ) -> Result<(), GuardError> {
        let settings = &self.config.rate_limit;
        let Some(class) = route.rate_class else {
            return Ok(());
        };
        if !settings.enabled {
            return Ok(());
        }
        if request
            .source_ip
            .is_some_and(|ip| settings.exempt_addresses.contains(&ip))
        {
            debug!(source_ip = ?request.source_ip, "Rate limit exempt address");
            return Ok(());
        }

        let key = rate_limit_key(principal, request.source_ip, class);
        let mut decision = self.limiter.check_policy(&key, &class.policy(settings));
        if decision.is_allowed() && !route.rate_tiers.is_empty() {
            decision = self.limiter.check_tiers(&key, &route.rate_tiers);
        }

        match decision {
            RateDecision::Allowed { .. } => Ok(()),
            RateDecision::Limited { retry_after_secs } => {
                Err(GuardError::RateLimited { retry_after_secs })
            }
        }
    }

    fn parse_input<I: DeserializeOwned>(&self, route: &RouteSpec, body: &[u8]) -> Result<I, GuardError> {
        let mut value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice::<Value>(body)
                .map_err(|e| GuardError::invalid_input(format!("request body is not valid JSON: {e}")))?
        };

        check_structure(&value, &self.config.limits)?;
        sanitize_value(&mut value);

        if let Some(schema) = &route.schema {
            schema
                .validate(&value)
                .into_result()
                .map_err(|fields| GuardError::validation("request validation failed", fields))?;
        }

        serde_json::from_value(value)
            .map_err(|e| GuardError::invalid_input(format!("invalid request body: {e}")))
    }

    fn callback_failed(&self, route: &RouteSpec, trace: &RequestTrace, err: anyhow::Error) -> GuardError {
        error!(
            function = %route.name,
            request_id = %trace.request_id,
            correlation_id = %trace.correlation_id,
            duration_ms = trace.elapsed().as_millis() as u64,
            error = %format!("{err:#}"),
            "Handler failed"
        );
        GuardError::internal(format!("{err:#}"))
    }

    fn failure(&self, err: &GuardError) -> GuardResponse {
        let now = self.clock.now();
        let mut headers = HeaderMap::new();
        if let Some(secs) = err.retry_after_secs(now) {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        GuardResponse {
            status: err.status_code(),
            headers,
            body: Some(envelope_json(&FailureEnvelope::from_error(
                err,
                self.config.environment,
                now,
            ))),
        }
    }

    fn finish(&self, mut response: GuardResponse, origin: Option<&str>, trace: &RequestTrace) -> GuardResponse {
        apply_cors(&mut response.headers, &self.config.cors, origin);
        apply_security_headers(&mut response.headers);
        trace.apply_headers(&mut response.headers);
        response
    }
}

impl<D> std::fmt::Debug for HandlerComposer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerComposer")
            .field("environment", &self.config.environment)
            .field("limiter_entries", &self.limiter.entry_count())
            .field("breakers", &self.breakers)
            .finish()
    }
}

fn envelope_json<T: Serialize>(envelope: &T) -> Value {
    serde_json::to_value(envelope).unwrap_or_else(|e| {
        serde_json::json!({ "success": false, "error": format!("response serialization failed: {e}") })
    })
}
