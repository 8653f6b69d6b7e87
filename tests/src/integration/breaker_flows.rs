//! # Circuit Breaker Flows
//!
//! A dependency that keeps failing trips its breaker; the breaker then serves
//! the fallback without touching the dependency, and recovers after the
//! recovery timeout once a trial call succeeds.
//!
//! ## Flow Tested:
//!
//! 1. **Trip**: three expected failures open the circuit
//! 2. **Fallback**: an open circuit answers from the fallback, operation untouched
//! 3. **Recovery**: after the timeout one success closes the circuit
//! 4. **Single trial**: concurrent callers after the timeout share one trial call
//! 5. **Composer**: an open dependency surfaces as 503 with `Retry-After`

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use handler_guard::domain::config::Environment;
    use handler_guard::middleware::{static_fallback, BreakerError};
    use handler_guard::{
        CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, GuardConfig, HandlerComposer,
        HandlerContext, InboundRequest, ManualClock, RouteSpec,
    };
    use serde::Deserialize;
    use serde_json::{json, Value};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    #[derive(Debug, Deserialize, PartialEq)]
    struct Report {
        cached: bool,
    }

    fn registry() -> (CircuitBreakerRegistry, ManualClock) {
        let clock = ManualClock::new();
        (CircuitBreakerRegistry::with_clock(Arc::new(clock.clone())), clock)
    }

    fn trip_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(3, Duration::from_secs(30))
            .with_expected_errors(["ServiceUnavailable"])
            .with_fallback(static_fallback(json!({ "cached": true })))
    }

    // =============================================================================
    // INTEGRATION TESTS: TRIP AND FALLBACK
    // =============================================================================

    #[tokio::test]
    async fn test_breaker_trip_and_fallback() {
        let (registry, _clock) = registry();
        let breaker = registry.get_or_create("reports", trip_config());

        for _ in 0..3 {
            let result: Result<Report, _> = breaker
                .execute(|| async { Err::<Report, _>("ServiceUnavailable: upstream down") })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invoked);
        let result: Result<Report, BreakerError<&str>> = breaker
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Report { cached: false })
            })
            .await;

        assert_eq!(result.unwrap(), Report { cached: true });
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_first_registration_wins() {
        let (registry, _clock) = registry();
        let first = registry.get_or_create("reports", trip_config());
        let second = registry.get_or_create("reports", CircuitBreakerConfig::new(99, Duration::from_secs(1)));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 3);
    }

    // =============================================================================
    // INTEGRATION TESTS: RECOVERY
    // =============================================================================

    #[tokio::test]
    async fn test_recovery_after_timeout() {
        let (registry, clock) = registry();
        let breaker = registry.get_or_create("reports", CircuitBreakerConfig::new(2, Duration::from_secs(30)));

        for _ in 0..2 {
            let _: Result<Value, _> = breaker.execute(|| async { Err::<Value, _>("boom") }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(10));
        let early: Result<Value, BreakerError<&str>> = breaker.execute(|| async { Ok(json!(1)) }).await;
        assert!(early.unwrap_err().is_open());

        clock.advance(Duration::from_secs(21));
        let trial: Result<Value, BreakerError<&str>> = breaker.execute(|| async { Ok(json!(1)) }).await;
        assert!(trial.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failures, 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_trial() {
        let (registry, clock) = registry();
        let breaker = registry.get_or_create("reports", trip_config());
        for _ in 0..3 {
            let _: Result<Report, _> = breaker
                .execute(|| async { Err::<Report, _>("ServiceUnavailable") })
                .await;
        }
        clock.advance(Duration::from_secs(30));

        let invoked = Arc::new(AtomicU32::new(0));
        let call = |counter: Arc<AtomicU32>| {
            let breaker = Arc::clone(&breaker);
            async move {
                breaker
                    .execute(|| async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok::<_, &str>(Report { cached: false })
                    })
                    .await
            }
        };
        let (a, b, c, d) = tokio::join!(
            call(Arc::clone(&invoked)),
            call(Arc::clone(&invoked)),
            call(Arc::clone(&invoked)),
            call(Arc::clone(&invoked)),
        );
        let results = [a, b, c, d];

        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        let live = results.iter().filter(|r| matches!(r, Ok(Report { cached: false }))).count();
        let cached = results.iter().filter(|r| matches!(r, Ok(Report { cached: true }))).count();
        assert_eq!((live, cached), (1, 3));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unexpected_errors_do_not_trip() {
        let (registry, _clock) = registry();
        let breaker = registry.get_or_create("reports", trip_config());

        for _ in 0..10 {
            let result: Result<Report, _> = breaker
                .execute(|| async { Err::<Report, _>("ValidationException: bad input") })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("ValidationException: bad input"))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    // =============================================================================
    // INTEGRATION TESTS: COMPOSER WITH DEPENDENCY
    // =============================================================================

    #[tokio::test]
    async fn test_composer_trips_dependency_then_serves_fallback() {
        let clock = ManualClock::new();
        let config = GuardConfig {
            environment: Environment::Development,
            ..GuardConfig::default()
        };
        let composer = HandlerComposer::with_clock(config, Arc::new(()), Arc::new(clock.clone()));
        composer
            .breakers()
            .get_or_create("bedrock", CircuitBreakerConfig::new(2, Duration::from_secs(60)));

        let route = RouteSpec::new("summarize").public().dependency("bedrock");
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&calls);
            let resp = composer
                .handle(&route, InboundRequest::post_json("summarize", "{}"), move |_: Value, _: HandlerContext<()>, _| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(anyhow::anyhow!("ModelTimeoutException"))
                })
                .await;
            assert_eq!(resp.status.as_u16(), 500);
        }

        let counter = Arc::clone(&calls);
        let resp = composer
            .handle(&route, InboundRequest::post_json("summarize", "{}"), move |_: Value, _: HandlerContext<()>, _| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(json!("fresh"))
            })
            .await;
        assert_eq!(resp.status.as_u16(), 503);
        assert_eq!(resp.header("retry-after"), Some("60"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let with_fallback = route.clone().fallback(static_fallback(json!("cached summary")));
        let resp = composer
            .handle(&with_fallback, InboundRequest::post_json("summarize", "{}"), |_: Value, _: HandlerContext<()>, _| async {
                Ok::<_, anyhow::Error>(json!("fresh"))
            })
            .await;
        assert_eq!(resp.status.as_u16(), 200);
        assert_eq!(resp.body.unwrap()["data"], "cached summary");
    }
}
