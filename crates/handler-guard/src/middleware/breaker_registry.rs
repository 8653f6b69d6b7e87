//! Named circuit breaker cache with per-service defaults.
//!
//! One breaker exists per dependency name for the lifetime of the registry.
//! The first `get_or_create` for a name fixes its configuration; later calls
//! return the existing breaker and ignore the supplied config.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::domain::clock::{system_clock, SharedClock};
use crate::domain::config::{CircuitBreakerSettings, ServiceBreakerSettings};
use crate::middleware::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, FallbackFn,
};

/// `(service, failure_threshold, recovery_secs, monitoring_secs, expected_errors)`
type DefaultEntry = (&'static str, u32, u64, u64, &'static [&'static str]);

const THROTTLING: &[&str] = &[
    "ThrottlingException",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "InternalServerError",
    "TimeoutError",
    "RequestTimeout",
];

/// Built-in table. Strictly rate-limited APIs trip early and wait long;
/// highly available storage tolerates more failures and retries sooner.
const SERVICE_DEFAULTS: &[DefaultEntry] = &[
    ("cost-explorer", 3, 60, 120, THROTTLING),
    ("security-hub", 3, 60, 120, THROTTLING),
    ("iam", 3, 45, 90, THROTTLING),
    ("bedrock", 3, 60, 120, &[
        "ThrottlingException",
        "ModelNotReadyException",
        "ServiceUnavailable",
        "ModelTimeoutException",
        "InternalServerError",
    ]),
    ("cognito", 5, 30, 60, &[
        "TooManyRequestsException",
        "InternalErrorException",
        "ServiceUnavailable",
        "TimeoutError",
    ]),
    ("ses", 5, 30, 60, &[
        "Throttling",
        "ServiceUnavailable",
        "InternalFailure",
        "TimeoutError",
    ]),
    ("sns", 5, 30, 60, &[
        "ThrottledException",
        "InternalErrorException",
        "ServiceUnavailable",
        "TimeoutError",
    ]),
    ("s3", 10, 15, 60, &[
        "SlowDown",
        "ServiceUnavailable",
        "InternalError",
        "RequestTimeout",
    ]),
];

/// Generic policy for names missing from the table: every error counts.
pub fn generic_defaults() -> ServiceBreakerSettings {
    ServiceBreakerSettings {
        failure_threshold: 5,
        recovery_timeout: Duration::from_secs(30),
        monitoring_period: Duration::from_secs(60),
        expected_errors: Vec::new(),
    }
}

/// Built-in policy for a known service
pub fn service_defaults(service: &str) -> Option<ServiceBreakerSettings> {
    SERVICE_DEFAULTS
        .iter()
        .find(|(name, ..)| *name == service)
        .map(|(_, threshold, recovery, monitoring, expected)| ServiceBreakerSettings {
            failure_threshold: *threshold,
            recovery_timeout: Duration::from_secs(*recovery),
            monitoring_period: Duration::from_secs(*monitoring),
            expected_errors: expected.iter().map(|e| (*e).to_string()).collect(),
        })
}

/// Registry of circuit breakers keyed by dependency name
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    overrides: HashMap<String, ServiceBreakerSettings>,
    clock: SharedClock,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            overrides: HashMap::new(),
            clock,
        }
    }

    /// Registry whose defaults are replaced by configured overrides.
    pub fn from_settings(settings: &CircuitBreakerSettings, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            overrides: settings.overrides.clone(),
            clock,
        }
    }

    /// Config a new breaker for `service` would receive: configured
    /// override, then built-in table, then the generic policy.
    pub fn default_config_for(&self, service: &str) -> CircuitBreakerConfig {
        let settings = self
            .overrides
            .get(service)
            .cloned()
            .or_else(|| service_defaults(service))
            .unwrap_or_else(generic_defaults);
        CircuitBreakerConfig::from(&settings)
    }

    /// Return the breaker for `name`, creating it with `config` if absent.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            info!(
                service = name,
                failure_threshold = config.failure_threshold,
                recovery_timeout_secs = config.recovery_timeout.as_secs(),
                "Registering circuit breaker"
            );
            Arc::new(CircuitBreaker::with_clock(name, config, Arc::clone(&self.clock)))
        });
        Arc::clone(entry.value())
    }

    /// Breaker for `name` using the default config chain.
    pub fn breaker_for(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        self.get_or_create(name, self.default_config_for(name))
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Metrics for every breaker, sorted by name
    pub fn list_metrics(&self) -> Vec<CircuitMetrics> {
        let mut metrics: Vec<_> = self.breakers.iter().map(|b| b.value().metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Force-close every breaker
    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        for breaker in breakers {
            breaker.force_close();
        }
        debug!(count = self.breakers.len(), "Reset all circuit breakers");
    }

    /// Force one breaker closed; false if unknown
    pub fn force_close(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.force_close();
                true
            }
            None => false,
        }
    }

    /// Force one breaker open; false if unknown
    pub fn force_open(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.force_open();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Run `operation` through the breaker for `service`.
    ///
    /// A supplied `fallback` takes precedence over any fallback on the
    /// breaker's registered config.
    pub async fn with_circuit_breaker<T, E, F, Fut>(
        &self,
        service: &str,
        operation: F,
        fallback: Option<FallbackFn>,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: DeserializeOwned,
        E: fmt::Display + fmt::Debug,
    {
        let breaker = self.breaker_for(service);
        breaker.execute_with_fallback(operation, fallback).await
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.len())
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::middleware::circuit_breaker::{static_fallback, CircuitState};
    use serde_json::{json, Value};

    fn registry() -> (CircuitBreakerRegistry, ManualClock) {
        let clock = ManualClock::new();
        (CircuitBreakerRegistry::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_first_registration_wins() {
        let (registry, _) = registry();
        let first = registry.get_or_create("svc", CircuitBreakerConfig::new(2, Duration::from_secs(5)));
        let second = registry.get_or_create("svc", CircuitBreakerConfig::new(9, Duration::from_secs(90)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_default_table() {
        let s3 = service_defaults("s3").unwrap();
        let cost = service_defaults("cost-explorer").unwrap();
        assert!(s3.failure_threshold > cost.failure_threshold);
        assert!(s3.recovery_timeout < cost.recovery_timeout);
        assert!(cost.expected_errors.iter().any(|e| e == "ThrottlingException"));

        for name in ["cost-explorer", "security-hub", "iam", "s3", "cognito", "ses", "sns", "bedrock"] {
            assert!(service_defaults(name).is_some(), "missing default for {name}");
        }
        assert!(service_defaults("unknown").is_none());
    }

    #[test]
    fn test_unlisted_service_uses_generic_policy() {
        let (registry, _) = registry();
        let config = registry.default_config_for("billing-api");
        assert_eq!(config.failure_threshold, 5);
        assert!(config.expected_errors.is_empty());
    }

    #[test]
    fn test_override_beats_table() {
        let mut settings = CircuitBreakerSettings::default();
        settings.overrides.insert(
            "s3".to_string(),
            ServiceBreakerSettings {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(1),
                monitoring_period: Duration::from_secs(1),
                expected_errors: Vec::new(),
            },
        );
        let registry = CircuitBreakerRegistry::from_settings(&settings, system_clock());
        assert_eq!(registry.default_config_for("s3").failure_threshold, 1);
        assert_eq!(registry.default_config_for("ses").failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_with_circuit_breaker_and_fallback() {
        let (registry, _) = registry();
        for _ in 0..3 {
            let result: Result<Value, BreakerError<String>> = registry
                .with_circuit_breaker(
                    "cost-explorer",
                    || async { Err("ThrottlingException: rate exceeded".to_string()) },
                    None,
                )
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }

        let metrics = registry.list_metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].state, CircuitState::Open);

        let served: Value = registry
            .with_circuit_breaker(
                "cost-explorer",
                || async { Ok::<_, String>(json!("live")) },
                Some(static_fallback(json!({"costs": []}))),
            )
            .await
            .unwrap();
        assert_eq!(served, json!({"costs": []}));
    }

    #[tokio::test]
    async fn test_reset_all_closes_everything() {
        let (registry, _) = registry();
        registry.get_or_create("a", CircuitBreakerConfig::default()).force_open();
        registry.get_or_create("b", CircuitBreakerConfig::default()).force_open();

        registry.reset_all();

        assert!(registry
            .list_metrics()
            .iter()
            .all(|m| m.state == CircuitState::Closed));
        assert!(registry.force_open("a"));
        assert!(!registry.force_close("missing"));
    }

    #[test]
    fn test_list_metrics_sorted() {
        let (registry, _) = registry();
        registry.breaker_for("sns");
        registry.breaker_for("iam");
        registry.breaker_for("s3");
        let names: Vec<_> = registry.list_metrics().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["iam", "s3", "sns"]);
    }
}
