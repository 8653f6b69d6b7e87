//! Fixed-window rate limiting with escalating blocks.
//!
//! Each identifier gets a counter for the current window. The `max`-th call
//! in a window passes; the next one blocks the identifier for longer than the
//! window. Repeat violations double the block, up to the policy's cap, until
//! the entry is forgotten.
//!
//! Tiered checks compose several windows (e.g. 10/minute and 100/hour) into a
//! sliding approximation: every tier is counted and any tier may reject.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::clock::{system_clock, to_chrono, SharedClock};
use crate::domain::config::{RateLimitConfig, RatePolicy};
use crate::domain::principal::Principal;

/// Operation class selecting a rate policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    #[default]
    Default,
    Auth,
    Sensitive,
    Export,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationClass::Default => "default",
            OperationClass::Auth => "auth",
            OperationClass::Sensitive => "sensitive",
            OperationClass::Export => "export",
        }
    }

    /// Configured policy for this class
    pub fn policy(self, config: &RateLimitConfig) -> RatePolicy {
        match self {
            OperationClass::Default => config.default,
            OperationClass::Auth => config.auth,
            OperationClass::Sensitive => config.sensitive,
            OperationClass::Export => config.export,
        }
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Per-identifier counter state
#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_reset: DateTime<Utc>,
    blocked: bool,
    block_until: Option<DateTime<Utc>>,
    /// Violations since the entry was created
    violations: u32,
    /// Entry is forgotten (violations included) after this instant
    expires_at: DateTime<Utc>,
}

impl RateLimitEntry {
    fn new(now: DateTime<Utc>, window: Duration) -> Self {
        let window_reset = now + to_chrono(window);
        Self {
            count: 0,
            window_reset,
            blocked: false,
            block_until: None,
            violations: 0,
            expires_at: window_reset,
        }
    }

    fn start_window(&mut self, now: DateTime<Utc>, window: Duration) {
        self.count = 0;
        self.window_reset = now + to_chrono(window);
        self.expires_at = self.expires_at.max(self.window_reset);
    }
}

/// Block length for the n-th violation: `block * 2^(n-1)`, capped.
fn escalated_block(policy: &RatePolicy, violations: u32) -> Duration {
    let factor = 1u32.checked_shl(violations.saturating_sub(1)).unwrap_or(u32::MAX);
    policy
        .block
        .checked_mul(factor)
        .unwrap_or(policy.max_block)
        .min(policy.max_block.max(policy.block))
}

fn ceil_secs(from: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let millis = (until - from).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

/// Rate limiter state shared across requests
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    clock: SharedClock,
    sweep_interval: Duration,
    last_sweep: Mutex<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(system_clock(), Duration::from_secs(60))
    }

    pub fn with_clock(clock: SharedClock, sweep_interval: Duration) -> Self {
        let now = clock.now();
        Self {
            entries: DashMap::new(),
            clock,
            sweep_interval,
            last_sweep: Mutex::new(now),
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: SharedClock) -> Self {
        Self::with_clock(clock, config.sweep_interval)
    }

    /// Fixed-window check. Exceeding blocks for twice the window.
    pub fn check(&self, identifier: &str, max_requests: u32, window: Duration) -> RateDecision {
        let block = window.saturating_mul(2);
        let policy = RatePolicy::new(max_requests, window, block, block.saturating_mul(8));
        self.check_policy(identifier, &policy)
    }

    /// Fixed-window check with the policy's block and escalation cap.
    pub fn check_policy(&self, identifier: &str, policy: &RatePolicy) -> RateDecision {
        let now = self.clock.now();
        self.maybe_sweep(now);

        let mut entry = self
            .entries
            .entry(identifier.to_string())
            .or_insert_with(|| RateLimitEntry::new(now, policy.window));

        // Past expiry the entry is stale even if the sweep has not run yet
        if now >= entry.expires_at {
            *entry = RateLimitEntry::new(now, policy.window);
        }

        if entry.blocked {
            match entry.block_until {
                Some(until) if now < until => {
                    return RateDecision::Limited {
                        retry_after_secs: ceil_secs(now, until),
                    };
                }
                _ => {
                    entry.blocked = false;
                    entry.block_until = None;
                    entry.start_window(now, policy.window);
                }
            }
        }

        if now >= entry.window_reset {
            entry.start_window(now, policy.window);
        }

        if entry.count < policy.max_requests {
            entry.count += 1;
            return RateDecision::Allowed {
                remaining: policy.max_requests - entry.count,
            };
        }

        entry.violations = entry.violations.saturating_add(1);
        let block = escalated_block(policy, entry.violations);
        let until = now + to_chrono(block);
        entry.blocked = true;
        entry.block_until = Some(until);
        // Remember the offender for one more block length after release
        entry.expires_at = until + to_chrono(block);

        warn!(
            identifier = identifier,
            max_requests = policy.max_requests,
            window_secs = policy.window.as_secs(),
            violations = entry.violations,
            block_secs = block.as_secs(),
            "Rate limit exceeded, blocking identifier"
        );

        RateDecision::Limited {
            retry_after_secs: ceil_secs(now, until),
        }
    }

    /// Evaluate every `(max_requests, window)` tier; rejected if any rejects.
    ///
    /// Tiers are keyed `{identifier}:t{index}:{window_ms}`, so tiers sharing a
    /// window keep separate counters. All of them count the call, including
    /// tiers after a rejecting one.
    pub fn check_tiers(&self, identifier: &str, tiers: &[(u32, Duration)]) -> RateDecision {
        let mut remaining = u32::MAX;
        let mut retry_after: Option<u64> = None;

        for (index, (max_requests, window)) in tiers.iter().enumerate() {
            let key = format!("{identifier}:t{index}:{}", window.as_millis());
            match self.check(&key, *max_requests, *window) {
                RateDecision::Allowed { remaining: left } => remaining = remaining.min(left),
                RateDecision::Limited { retry_after_secs } => {
                    retry_after = Some(retry_after.map_or(retry_after_secs, |r| r.max(retry_after_secs)));
                }
            }
        }

        match retry_after {
            Some(retry_after_secs) => RateDecision::Limited { retry_after_secs },
            None => RateDecision::Allowed {
                remaining: if tiers.is_empty() { 0 } else { remaining },
            },
        }
    }

    /// Forget one identifier
    pub fn reset(&self, identifier: &str) {
        self.entries.remove(identifier);
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        {
            let mut last = self.last_sweep.lock();
            if now - *last < to_chrono(self.sweep_interval) {
                return;
            }
            *last = now;
        }
        self.sweep_at(now);
    }

    /// Remove expired, unblocked entries now
    pub fn cleanup(&self) {
        self.sweep_at(self.clock.now());
    }

    fn sweep_at(&self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let block_over = entry.block_until.map_or(true, |until| now >= until);
            !(now >= entry.expires_at && block_over)
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept expired rate limit entries");
        }
    }

    /// Number of tracked identifiers
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate-limit key for one caller and operation class.
///
/// Anonymous callers are keyed by source address only.
pub fn rate_limit_key(
    principal: Option<&Principal>,
    source: Option<IpAddr>,
    class: OperationClass,
) -> String {
    let source = source.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    match principal {
        Some(p) => format!(
            "{}:{}:{}:{}",
            class.as_str(),
            p.user_id,
            p.organization_id.as_deref().unwrap_or("-"),
            source
        ),
        None => format!("{}:anon:{}", class.as_str(), source),
    }
}

/// Background task sweeping expired entries on a fixed interval
pub async fn sweep_task(limiter: Arc<RateLimiter>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        limiter.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use std::net::Ipv4Addr;

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        (
            RateLimiter::with_clock(Arc::new(clock.clone()), Duration::from_secs(60)),
            clock,
        )
    }

    #[test]
    fn test_boundary_max_passes_next_rejected() {
        let (limiter, _) = limiter();
        let window = Duration::from_secs(60);

        for i in 1..=5 {
            assert_eq!(
                limiter.check("user-1", 5, window),
                RateDecision::Allowed { remaining: 5 - i }
            );
        }
        match limiter.check("user-1", 5, window) {
            RateDecision::Limited { retry_after_secs } => assert!(retry_after_secs > 60),
            other => panic!("expected limited, got {other:?}"),
        }
    }

    #[test]
    fn test_block_outlasts_window() {
        let (limiter, clock) = limiter();
        let window = Duration::from_secs(10);
        for _ in 0..3 {
            limiter.check("k", 2, window);
        }

        clock.advance(Duration::from_secs(11));
        assert!(!limiter.check("k", 2, window).is_allowed());

        clock.advance(Duration::from_secs(10));
        assert!(limiter.check("k", 2, window).is_allowed());
    }

    #[test]
    fn test_window_resets() {
        let (limiter, clock) = limiter();
        let window = Duration::from_secs(1);
        assert!(limiter.check("k", 1, window).is_allowed());
        clock.advance(Duration::from_millis(1001));
        assert!(limiter.check("k", 1, window).is_allowed());
    }

    #[test]
    fn test_identifiers_are_independent() {
        let (limiter, _) = limiter();
        let window = Duration::from_secs(60);
        assert!(limiter.check("a", 1, window).is_allowed());
        assert!(!limiter.check("a", 1, window).is_allowed());
        assert!(limiter.check("b", 1, window).is_allowed());
    }

    #[test]
    fn test_escalating_blocks() {
        let (limiter, clock) = limiter();
        let policy = RatePolicy::new(
            1,
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(300),
        );

        let mut blocks = Vec::new();
        for _ in 0..3 {
            assert!(limiter.check_policy("k", &policy).is_allowed());
            match limiter.check_policy("k", &policy) {
                RateDecision::Limited { retry_after_secs } => blocks.push(retry_after_secs),
                other => panic!("expected limited, got {other:?}"),
            }
            clock.advance(Duration::from_secs(blocks.last().copied().unwrap_or(0)));
        }
        assert_eq!(blocks, vec![120, 240, 300]);
    }

    #[test]
    fn test_violations_forgotten_after_cooldown() {
        let (limiter, clock) = limiter();
        let policy = RatePolicy::new(
            1,
            Duration::from_secs(60),
            Duration::from_secs(120),
            Duration::from_secs(600),
        );
        limiter.check_policy("k", &policy);
        limiter.check_policy("k", &policy);

        // Block (120s) plus cooldown (120s)
        clock.advance(Duration::from_secs(241));
        limiter.check_policy("k", &policy);
        assert_eq!(
            limiter.check_policy("k", &policy),
            RateDecision::Limited { retry_after_secs: 120 }
        );
    }

    #[test]
    fn test_tiers_are_a_conjunction() {
        let (limiter, clock) = limiter();
        let tiers = [(3, Duration::from_secs(1)), (5, Duration::from_secs(60))];

        for _ in 0..3 {
            assert!(limiter.check_tiers("u", &tiers).is_allowed());
        }
        // Short tier exhausted
        assert!(!limiter.check_tiers("u", &tiers).is_allowed());

        // Short tier blocks for 2s; long tier has counted 4 calls
        clock.advance(Duration::from_secs(3));
        assert!(limiter.check_tiers("u", &tiers).is_allowed());
        // Long tier now rejects even though the short tier allows
        assert!(!limiter.check_tiers("u", &tiers).is_allowed());
        assert_eq!(limiter.entry_count(), 2);
    }

    #[test]
    fn test_tiers_with_equal_windows_count_separately() {
        let (limiter, _) = limiter();
        let tiers = [(5, Duration::from_secs(60)), (3, Duration::from_secs(60))];

        for _ in 0..3 {
            assert!(limiter.check_tiers("u", &tiers).is_allowed());
        }
        assert!(!limiter.check_tiers("u", &tiers).is_allowed());
        assert_eq!(limiter.entry_count(), 2);
    }

    #[test]
    fn test_tiers_report_longest_retry() {
        let (limiter, _) = limiter();
        let tiers = [(1, Duration::from_secs(1)), (1, Duration::from_secs(30))];
        limiter.check_tiers("u", &tiers);
        assert_eq!(
            limiter.check_tiers("u", &tiers),
            RateDecision::Limited { retry_after_secs: 60 }
        );
    }

    #[test]
    fn test_opportunistic_sweep() {
        let (limiter, clock) = limiter();
        limiter.check("old", 10, Duration::from_secs(5));
        assert_eq!(limiter.entry_count(), 1);

        clock.advance(Duration::from_secs(61));
        limiter.check("new", 10, Duration::from_secs(5));
        assert_eq!(limiter.entry_count(), 1);
    }

    #[test]
    fn test_blocked_entries_survive_sweep() {
        let (limiter, clock) = limiter();
        let policy = RatePolicy::new(
            1,
            Duration::from_secs(1),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        limiter.check_policy("abuser", &policy);
        limiter.check_policy("abuser", &policy);

        clock.advance(Duration::from_secs(120));
        limiter.cleanup();
        assert_eq!(limiter.entry_count(), 1);
        assert!(!limiter.check_policy("abuser", &policy).is_allowed());
    }

    #[test]
    fn test_class_policies() {
        let config = RateLimitConfig::default();
        assert_eq!(OperationClass::Auth.policy(&config).max_requests, 10);
        assert_eq!(OperationClass::Export.policy(&config).max_requests, 3);
    }

    #[test]
    fn test_rate_limit_key() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let principal = Principal::new("u1").with_organization("org");
        assert_eq!(
            rate_limit_key(Some(&principal), Some(ip), OperationClass::Auth),
            "auth:u1:org:10.0.0.1"
        );
        assert_eq!(
            rate_limit_key(None, None, OperationClass::Default),
            "default:anon:unknown"
        );
    }
}
