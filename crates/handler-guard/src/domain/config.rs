//! Guard configuration with validation.
//!
//! Every section defaults to production-safe values; a partial JSON document
//! only needs to name what it overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Main guard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Deployment classification (controls error detail exposure)
    pub environment: Environment,
    /// CORS negotiation
    pub cors: CorsConfig,
    /// Payload and structure limits
    pub limits: LimitsConfig,
    /// Rate limiting policies per operation class
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker switches and per-service overrides
    pub circuit_breaker: CircuitBreakerSettings,
    /// Authorization settings
    pub auth: AuthSettings,
    /// Log output
    pub logging: LoggingConfig,
}

impl GuardConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        let ceilings = [
            ("max_json_bytes", limits.max_json_bytes),
            ("max_multipart_bytes", limits.max_multipart_bytes),
            ("max_form_bytes", limits.max_form_bytes),
            ("max_text_bytes", limits.max_text_bytes),
            ("max_default_bytes", limits.max_default_bytes),
            ("max_depth", limits.max_depth),
            ("max_array_length", limits.max_array_length),
            ("max_object_keys", limits.max_object_keys),
        ];
        for (name, value) in ceilings {
            if value == 0 {
                return Err(ConfigError::InvalidLimit(format!("{name} cannot be 0")));
            }
        }

        for (class, policy) in self.rate_limit.policies() {
            policy
                .validate()
                .map_err(|reason| ConfigError::InvalidRateLimit(format!("{class}: {reason}")))?;
        }

        for (service, settings) in &self.circuit_breaker.overrides {
            if settings.failure_threshold == 0 {
                return Err(ConfigError::InvalidCircuitBreaker(format!(
                    "{service}: failure_threshold cannot be 0"
                )));
            }
            if settings.recovery_timeout.is_zero() {
                return Err(ConfigError::InvalidCircuitBreaker(format!(
                    "{service}: recovery_timeout cannot be 0"
                )));
            }
        }

        Ok(())
    }
}

/// Deployment classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Internal error detail is withheld from clients
    #[default]
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins ("*" for all)
    pub allowed_origins: Vec<String>,
    /// Allowed request headers
    pub allowed_headers: Vec<String>,
    /// Headers the browser may read
    pub expose_headers: Vec<String>,
    /// Max age for preflight cache (seconds)
    pub max_age: u64,
    /// Allow credentials (only sent with a concrete origin)
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_headers: vec![
                "Content-Type".to_string(),
                "Authorization".to_string(),
                "X-API-Key".to_string(),
                "X-Request-ID".to_string(),
                "X-Correlation-ID".to_string(),
            ],
            expose_headers: vec![
                "X-Request-ID".to_string(),
                "X-Correlation-ID".to_string(),
                "X-Response-Time".to_string(),
                "Retry-After".to_string(),
            ],
            max_age: 86400, // 24 hours
            allow_credentials: false,
        }
    }
}

/// Payload and structure limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Max `application/json` body in bytes (default: 1MB)
    pub max_json_bytes: usize,
    /// Max `multipart/form-data` body in bytes (default: 10MB)
    pub max_multipart_bytes: usize,
    /// Max `application/x-www-form-urlencoded` body in bytes (default: 100KB)
    pub max_form_bytes: usize,
    /// Max `text/plain` body in bytes (default: 100KB)
    pub max_text_bytes: usize,
    /// Max body for any other or missing content type (default: 1MB)
    pub max_default_bytes: usize,
    /// Max JSON nesting depth
    pub max_depth: usize,
    /// Max elements in any array
    pub max_array_length: usize,
    /// Max keys in any object
    pub max_object_keys: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_json_bytes: 1024 * 1024,
            max_multipart_bytes: 10 * 1024 * 1024,
            max_form_bytes: 100 * 1024,
            max_text_bytes: 100 * 1024,
            max_default_bytes: 1024 * 1024,
            max_depth: 10,
            max_array_length: 1000,
            max_object_keys: 500,
        }
    }
}

impl LimitsConfig {
    /// Largest ceiling across content types (outer transport limit)
    pub fn largest_ceiling(&self) -> usize {
        [
            self.max_json_bytes,
            self.max_multipart_bytes,
            self.max_form_bytes,
            self.max_text_bytes,
            self.max_default_bytes,
        ]
        .into_iter()
        .max()
        .unwrap_or(self.max_default_bytes)
    }
}

/// A named rate-limit policy: `max_requests` per `window`, then blocked for
/// `block` (doubling per repeat violation, capped at `max_block`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePolicy {
    pub max_requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(with = "humantime_serde")]
    pub block: Duration,
    #[serde(with = "humantime_serde")]
    pub max_block: Duration,
}

impl RatePolicy {
    pub const fn new(max_requests: u32, window: Duration, block: Duration, max_block: Duration) -> Self {
        Self {
            max_requests,
            window,
            block,
            max_block,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_requests == 0 {
            return Err("max_requests cannot be 0".into());
        }
        if self.window.is_zero() {
            return Err("window cannot be 0".into());
        }
        if self.block <= self.window {
            return Err("block must be longer than window".into());
        }
        if self.max_block < self.block {
            return Err("max_block cannot be shorter than block".into());
        }
        Ok(())
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Minimum interval between opportunistic sweeps of expired entries
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Source addresses exempt from limiting
    pub exempt_addresses: Vec<IpAddr>,
    /// Ordinary reads and writes
    pub default: RatePolicy,
    /// Login, token refresh, password reset
    pub auth: RatePolicy,
    /// Credential changes, MFA, billing
    pub sensitive: RatePolicy,
    /// Report generation and bulk export
    pub export: RatePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval: Duration::from_secs(60),
            exempt_addresses: Vec::new(),
            default: RatePolicy::new(
                100,
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(15 * 60),
            ),
            auth: RatePolicy::new(
                10,
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(60 * 60),
            ),
            sensitive: RatePolicy::new(
                5,
                Duration::from_secs(60),
                Duration::from_secs(10 * 60),
                Duration::from_secs(2 * 60 * 60),
            ),
            export: RatePolicy::new(
                3,
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(4 * 60 * 60),
            ),
        }
    }
}

impl RateLimitConfig {
    fn policies(&self) -> [(&'static str, &RatePolicy); 4] {
        [
            ("default", &self.default),
            ("auth", &self.auth),
            ("sensitive", &self.sensitive),
            ("export", &self.export),
        ]
    }
}

/// Serializable breaker policy for one dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBreakerSettings {
    /// Counted failures before the breaker opens
    pub failure_threshold: u32,
    /// Time an open breaker waits before a half-open trial
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Quiet period after which failure counters decay to zero
    #[serde(with = "humantime_serde")]
    pub monitoring_period: Duration,
    /// Error classifications that count toward tripping (empty = all)
    #[serde(default)]
    pub expected_errors: Vec<String>,
}

/// Circuit breaker configuration for downstream resilience
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Wrap route callbacks that declare a dependency
    pub enabled: bool,
    /// Per-service policy replacing the built-in default table entry
    pub overrides: HashMap<String, ServiceBreakerSettings>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            overrides: HashMap::new(),
        }
    }
}

/// Authorization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Role that satisfies every role requirement
    pub superuser_role: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            superuser_role: Some("super_admin".to_string()),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of the compact text format
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Document could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid rate limiting configuration
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    /// Invalid breaker override
    #[error("invalid circuit breaker settings: {0}")]
    InvalidCircuitBreaker(String),
}

/// Humantime serde module for Duration serialization
pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .trim()
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|_| "invalid hours")
        } else {
            // Try parsing as plain seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
