//! CORS negotiation and security headers.
//!
//! Applied to every response the guard produces, including rejections, so a
//! browser client can always read the error envelope.

use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    REFERRER_POLICY, VARY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use axum::http::{HeaderMap, HeaderValue};

use crate::domain::config::CorsConfig;

const ALLOWED_METHODS: &str = "POST, OPTIONS";

/// Origin to echo back: the request origin when allowed, otherwise `*`.
pub fn negotiate_origin(config: &CorsConfig, origin: Option<&str>) -> Option<String> {
    let origin = origin?;
    let allowed = config
        .allowed_origins
        .iter()
        .any(|o| o == origin || (o == "*" && config.allow_credentials));
    allowed.then(|| origin.to_string())
}

/// Add CORS headers for a normal response
pub fn apply_cors(headers: &mut HeaderMap, config: &CorsConfig, origin: Option<&str>) {
    match negotiate_origin(config, origin).and_then(|o| HeaderValue::from_str(&o).ok()) {
        Some(value) => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
            headers.insert(VARY, HeaderValue::from_static("Origin"));
            if config.allow_credentials {
                headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
            }
        }
        None => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        }
    }

    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOWED_METHODS));
    if let Ok(value) = HeaderValue::from_str(&config.allowed_headers.join(", ")) {
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, value);
    }
    if !config.expose_headers.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&config.expose_headers.join(", ")) {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
    }
}

/// Add CORS headers for an OPTIONS preflight response
pub fn apply_preflight(headers: &mut HeaderMap, config: &CorsConfig, origin: Option<&str>) {
    apply_cors(headers, config, origin);
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(config.max_age));
}

/// Add the fixed security headers
pub fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(
        REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}
