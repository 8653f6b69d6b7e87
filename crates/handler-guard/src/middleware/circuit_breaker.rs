//! Circuit breaker for downstream dependency resilience.
//!
//! Wraps any async call to a named dependency. When the dependency fails
//! repeatedly the breaker opens and calls are rejected immediately (or served
//! by a fallback) until the recovery timeout elapses and a trial call succeeds.
//!
//! # Circuit Breaker States
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                    CIRCUIT BREAKER STATE MACHINE                    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │      ┌──────────┐ failures >= N ┌──────────┐ now >= next ┌────────┐ │
//! │      │  CLOSED  │ ────────────► │   OPEN   │ ──────────► │  HALF  │ │
//! │      │ (normal) │               │ (reject) │             │  OPEN  │ │
//! │      └──────────┘               └──────────┘             └────────┘ │
//! │        ▲    ▲                        ▲        failure (>= N)   │    │
//! │        │    │ quiet > monitoring     └─────────────────────────┤    │
//! │        │    └ (failures decay to 0)                            │    │
//! │        └───────────────────────────────────────────────────────┘    │
//! │                         one success                                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Failure classification
//!
//! With a non-empty `expected_errors` list, only errors whose `Display` or
//! `Debug` text contains one of the entries (case-insensitive) count toward
//! tripping. Every error is still returned to the caller unchanged.
//!
//! # Concurrency
//!
//! State is read and written under a short lock on either side of the awaited
//! operation, never across it. Concurrent callers that are admitted together
//! at the tripping boundary may all reach the dependency. HALF_OPEN admits a
//! single trial call; other callers are rejected (or served the fallback)
//! until it settles. A trial that never settles, for example because its
//! future was dropped, is superseded after one recovery timeout.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::clock::{system_clock, to_chrono, SharedClock};
use crate::domain::config::ServiceBreakerSettings;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit is open - requests are rejected immediately
    Open,
    /// Recovery window elapsed - one trial request passes through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Produces a substitute value while the breaker is open.
///
/// The value is deserialized into the caller's result type.
pub type FallbackFn = Arc<dyn Fn() -> BoxFuture<'static, serde_json::Value> + Send + Sync>;

/// Observes state transitions as `(name, previous, next)`.
pub type StateObserver = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Wrap a closure returning a fixed JSON value as a [`FallbackFn`].
pub fn static_fallback(value: serde_json::Value) -> FallbackFn {
    Arc::new(move || {
        let value = value.clone();
        Box::pin(async move { value })
    })
}

/// Circuit breaker configuration
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Number of counted failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration an open circuit waits before allowing a trial call
    pub recovery_timeout: Duration,
    /// Quiet period after the last failure at which failures decay to zero
    pub monitoring_period: Duration,
    /// Error classifications that count toward tripping (empty = all)
    pub expected_errors: Vec<String>,
    /// Served instead of an open-circuit error
    pub fallback: Option<FallbackFn>,
    /// Notified on every state transition
    pub on_state_change: Option<StateObserver>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            expected_errors: Vec::new(),
            fallback: None,
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            ..Self::default()
        }
    }

    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }

    pub fn with_expected_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_errors = errors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackFn) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.on_state_change = Some(observer);
        self
    }
}

impl From<&ServiceBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &ServiceBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: settings.recovery_timeout,
            monitoring_period: settings.monitoring_period,
            expected_errors: settings.expected_errors.clone(),
            fallback: None,
            on_state_change: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .field("monitoring_period", &self.monitoring_period)
            .field("expected_errors", &self.expected_errors)
            .field("fallback", &self.fallback.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// Errors returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Circuit is open and no fallback is configured
    #[error("circuit breaker for {service} is open, retry after {retry_at}")]
    Open {
        service: String,
        retry_at: DateTime<Utc>,
    },

    /// Fallback value does not fit the caller's result type
    #[error("fallback for {service} produced an incompatible value: {source}")]
    Fallback {
        service: String,
        #[source]
        source: serde_json::Error,
    },

    /// The wrapped operation failed
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The operation's own error, if that is what this is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Point-in-time view of a breaker for dashboards and health checks
#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u64,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    /// Current failures as a percentage of total requests
    pub failure_rate: f64,
}

/// Mutable breaker state
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u64,
    total_requests: u64,
    rejected_requests: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    next_attempt_time: Option<DateTime<Utc>>,
    /// Start of the half-open trial call still awaiting its outcome
    trial_in_flight: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            total_requests: 0,
            rejected_requests: 0,
            last_failure_time: None,
            last_success_time: None,
            next_attempt_time: None,
            trial_in_flight: None,
        }
    }

    /// Move to `to`, returning the transition if the state changed.
    fn transition(&mut self, to: CircuitState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.trial_in_flight = None;
        Some(Transition { from, to })
    }
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

enum Admission {
    Allowed,
    Rejected { retry_at: DateTime<Utc> },
}

/// Circuit breaker guarding one named dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Create a breaker reading wall-clock time
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Run `operation` through the breaker.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: DeserializeOwned,
        E: fmt::Display + fmt::Debug,
    {
        self.execute_with_fallback(operation, None).await
    }

    /// Run `operation` through the breaker, preferring `fallback` over the
    /// configured one when the circuit is open.
    pub async fn execute_with_fallback<T, E, F, Fut>(
        &self,
        operation: F,
        fallback: Option<FallbackFn>,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: DeserializeOwned,
        E: fmt::Display + fmt::Debug,
    {
        match self.admit() {
            Admission::Rejected { retry_at } => {
                match fallback.or_else(|| self.config.fallback.clone()) {
                    Some(fallback) => {
                        debug!(service = %self.name, "Circuit open, serving fallback");
                        let value = fallback().await;
                        serde_json::from_value(value).map_err(|source| BreakerError::Fallback {
                            service: self.name.clone(),
                            source,
                        })
                    }
                    None => Err(BreakerError::Open {
                        service: self.name.clone(),
                        retry_at,
                    }),
                }
            }
            Admission::Allowed => match operation().await {
                Ok(value) => {
                    self.record_success();
                    Ok(value)
                }
                Err(error) => {
                    self.record_failure(&error);
                    Err(BreakerError::Inner(error))
                }
            },
        }
    }

    /// Count the call and decide whether it may proceed.
    fn admit(&self) -> Admission {
        let now = self.clock.now();
        let mut transitions = Vec::new();

        let admission = {
            let mut st = self.state.lock();
            st.total_requests += 1;

            // Failure decay: a quiet monitoring period clears accumulated failures
            if st.failures > 0 {
                if let Some(last_failure) = st.last_failure_time {
                    if now - last_failure > to_chrono(self.config.monitoring_period) {
                        debug!(
                            service = %self.name,
                            failures = st.failures,
                            "Failure count decayed after quiet monitoring period"
                        );
                        st.failures = 0;
                        st.next_attempt_time = None;
                        transitions.extend(st.transition(CircuitState::Closed));
                    }
                }
            }

            match st.state {
                CircuitState::Closed => Admission::Allowed,
                CircuitState::HalfOpen => {
                    let superseded_at = st.trial_in_flight.map(|started| {
                        started
                            .checked_add_signed(to_chrono(self.config.recovery_timeout))
                            .unwrap_or(DateTime::<Utc>::MAX_UTC)
                    });
                    match superseded_at {
                        Some(retry_at) if now < retry_at => {
                            st.rejected_requests += 1;
                            debug!(
                                service = %self.name,
                                "Half-open trial in flight, rejecting request"
                            );
                            Admission::Rejected { retry_at }
                        }
                        _ => {
                            st.trial_in_flight = Some(now);
                            Admission::Allowed
                        }
                    }
                }
                CircuitState::Open => {
                    let next_attempt = st.next_attempt_time.unwrap_or(now);
                    if now >= next_attempt {
                        transitions.extend(st.transition(CircuitState::HalfOpen));
                        st.trial_in_flight = Some(now);
                        Admission::Allowed
                    } else {
                        st.rejected_requests += 1;
                        warn!(
                            service = %self.name,
                            retry_at = %next_attempt,
                            remaining_ms = (next_attempt - now).num_milliseconds(),
                            "Circuit breaker is open, rejecting request"
                        );
                        Admission::Rejected {
                            retry_at: next_attempt,
                        }
                    }
                }
            }
        };

        self.notify(&transitions);
        admission
    }

    fn record_success(&self) {
        let now = self.clock.now();
        let transition = {
            let mut st = self.state.lock();
            st.successes += 1;
            st.last_success_time = Some(now);
            st.trial_in_flight = None;
            if st.state == CircuitState::HalfOpen {
                st.failures = 0;
                st.next_attempt_time = None;
                st.transition(CircuitState::Closed)
            } else {
                None
            }
        };
        self.notify(transition.as_slice());
    }

    fn record_failure<E>(&self, error: &E)
    where
        E: fmt::Display + fmt::Debug,
    {
        if !self.is_expected(error) {
            // Settles a half-open trial without counting; the next caller retries
            self.state.lock().trial_in_flight = None;
            debug!(
                service = %self.name,
                error = %error,
                "Error not in expected list, not counted toward tripping"
            );
            return;
        }

        let now = self.clock.now();
        let transition = {
            let mut st = self.state.lock();
            st.failures = st.failures.saturating_add(1);
            st.last_failure_time = Some(now);
            st.trial_in_flight = None;

            warn!(
                service = %self.name,
                failures = st.failures,
                threshold = self.config.failure_threshold,
                state = %st.state,
                error = %error,
                "Downstream call failed"
            );

            if st.failures >= self.config.failure_threshold && st.state != CircuitState::Open {
                let next_attempt = now
                    .checked_add_signed(to_chrono(self.config.recovery_timeout))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                st.next_attempt_time = Some(next_attempt);
                st.transition(CircuitState::Open)
            } else {
                None
            }
        };
        self.notify(transition.as_slice());
    }

    /// Whether `error` counts toward tripping.
    fn is_expected<E>(&self, error: &E) -> bool
    where
        E: fmt::Display + fmt::Debug,
    {
        if self.config.expected_errors.is_empty() {
            return true;
        }
        let display = error.to_string().to_lowercase();
        let debug = format!("{error:?}").to_lowercase();
        self.config.expected_errors.iter().any(|expected| {
            let expected = expected.to_lowercase();
            display.contains(&expected) || debug.contains(&expected)
        })
    }

    /// Force the breaker closed and clear failures (ops utility)
    pub fn force_close(&self) {
        let transition = {
            let mut st = self.state.lock();
            st.failures = 0;
            st.next_attempt_time = None;
            st.transition(CircuitState::Closed)
        };
        info!(service = %self.name, "Circuit breaker manually reset");
        self.notify(transition.as_slice());
    }

    /// Force the breaker open for one recovery timeout (ops utility)
    pub fn force_open(&self) {
        let now = self.clock.now();
        let transition = {
            let mut st = self.state.lock();
            st.next_attempt_time = now.checked_add_signed(to_chrono(self.config.recovery_timeout));
            st.transition(CircuitState::Open)
        };
        info!(service = %self.name, "Circuit breaker manually opened");
        self.notify(transition.as_slice());
    }

    /// Snapshot for dashboards
    pub fn metrics(&self) -> CircuitMetrics {
        let st = self.state.lock();
        let failure_rate = if st.total_requests == 0 {
            0.0
        } else {
            f64::from(st.failures) / st.total_requests as f64 * 100.0
        };
        CircuitMetrics {
            name: self.name.clone(),
            state: st.state,
            failures: st.failures,
            successes: st.successes,
            total_requests: st.total_requests,
            rejected_requests: st.rejected_requests,
            last_failure_time: st.last_failure_time,
            last_success_time: st.last_success_time,
            next_attempt_time: st.next_attempt_time,
            failure_rate,
        }
    }

    /// Log and forward transitions to the observer. Never called under the lock.
    fn notify(&self, transitions: &[Transition]) {
        for t in transitions {
            match t.to {
                CircuitState::Open => warn!(
                    service = %self.name,
                    from = %t.from,
                    to = %t.to,
                    recovery_timeout_secs = self.config.recovery_timeout.as_secs(),
                    "Circuit breaker opened"
                ),
                _ => info!(
                    service = %self.name,
                    from = %t.from,
                    to = %t.to,
                    "Circuit breaker state changed"
                ),
            }

            if let Some(observer) = &self.config.on_state_change {
                let result = catch_unwind(AssertUnwindSafe(|| observer(&self.name, t.from, t.to)));
                if result.is_err() {
                    warn!(service = %self.name, "State change observer panicked");
                }
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
