//! # Rate Limit Flows
//!
//! Tiered windows compose by conjunction, repeat offenders wait longer, and
//! the composer keys limits per caller and operation class.
//!
//! ## Flow Tested:
//!
//! 1. **Tier composition**: a tight short tier rejects although the long tier has room
//! 2. **Escalation**: each violation doubles the block up to the cap
//! 3. **Composer**: per-route tiers and `Retry-After` on 429

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use handler_guard::domain::config::{Environment, RatePolicy};
    use handler_guard::middleware::RateDecision;
    use handler_guard::{
        GuardConfig, HandlerComposer, HandlerContext, InboundRequest, ManualClock, OperationClass,
        RateLimiter, RouteSpec,
    };
    use serde_json::{json, Value};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        (
            RateLimiter::with_clock(Arc::new(clock.clone()), Duration::from_secs(300)),
            clock,
        )
    }

    async fn ok(_: Value, _: HandlerContext<()>, _: InboundRequest) -> anyhow::Result<Value> {
        Ok(json!({ "ok": true }))
    }

    fn from(ip: [u8; 4]) -> InboundRequest {
        InboundRequest::post_json("export", "{}").with_source_ip(IpAddr::V4(Ipv4Addr::from(ip)))
    }

    // =============================================================================
    // INTEGRATION TESTS: TIERS
    // =============================================================================

    #[test]
    fn test_sliding_window_composition() {
        let (limiter, clock) = limiter();
        let tiers = [(5, Duration::from_millis(1000)), (20, Duration::from_millis(60_000))];

        for _ in 0..5 {
            assert!(limiter.check_tiers("user-1", &tiers).is_allowed());
            clock.advance(Duration::from_millis(100));
        }

        // Sixth call inside the same second: the 60s tier is at 6 of 20
        assert!(!limiter.check_tiers("user-1", &tiers).is_allowed());

        // Once the short tier's block has passed the long tier still has room
        clock.advance(Duration::from_secs(3));
        assert!(limiter.check_tiers("user-1", &tiers).is_allowed());
    }

    #[test]
    fn test_long_tier_rejects_alone() {
        let (limiter, clock) = limiter();
        let tiers = [(5, Duration::from_secs(1)), (8, Duration::from_secs(60))];

        for _ in 0..8 {
            assert!(limiter.check_tiers("user-2", &tiers).is_allowed());
            clock.advance(Duration::from_millis(500));
        }
        match limiter.check_tiers("user-2", &tiers) {
            RateDecision::Limited { retry_after_secs } => assert_eq!(retry_after_secs, 120),
            other => panic!("expected limit, got {other:?}"),
        }
    }

    // =============================================================================
    // INTEGRATION TESTS: ESCALATION
    // =============================================================================

    #[test]
    fn test_repeat_offender_blocks_grow() {
        let (limiter, clock) = limiter();
        let policy = RatePolicy::new(
            1,
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(50),
        );

        let mut blocks = Vec::new();
        for _ in 0..3 {
            assert!(limiter.check_policy("abuser", &policy).is_allowed());
            let retry_after_secs = match limiter.check_policy("abuser", &policy) {
                RateDecision::Limited { retry_after_secs } => retry_after_secs,
                other => panic!("expected limit, got {other:?}"),
            };
            blocks.push(retry_after_secs);
            clock.advance(Duration::from_secs(retry_after_secs));
        }
        assert_eq!(blocks, vec![20, 40, 50]);
    }

    // =============================================================================
    // INTEGRATION TESTS: COMPOSER
    // =============================================================================

    #[tokio::test]
    async fn test_route_tiers_through_composer() {
        let config = GuardConfig {
            environment: Environment::Development,
            ..GuardConfig::default()
        };
        let composer = HandlerComposer::with_clock(config, Arc::new(()), Arc::new(ManualClock::new()));
        let route = RouteSpec::new("export")
            .public()
            .rate_class(OperationClass::Export)
            .rate_tier(2, Duration::from_secs(1));

        for _ in 0..2 {
            let resp = composer.handle(&route, from([198, 51, 100, 1]), ok).await;
            assert_eq!(resp.status.as_u16(), 200);
        }
        let resp = composer.handle(&route, from([198, 51, 100, 1]), ok).await;
        assert_eq!(resp.status.as_u16(), 429);
        assert!(resp.header("retry-after").is_some());
        assert_eq!(resp.body.unwrap()["code"], "RATE_LIMITED");

        // Another address has its own budget
        let resp = composer.handle(&route, from([198, 51, 100, 2]), ok).await;
        assert_eq!(resp.status.as_u16(), 200);
    }
}
