//! Transport-neutral view of an incoming function call.

use std::net::{IpAddr, SocketAddr};

use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method};

/// One request as seen by the composer
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Function name from the route path
    pub function: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Resolved client address, if known
    pub source_ip: Option<IpAddr>,
}

impl InboundRequest {
    pub fn new(method: Method, function: impl Into<String>) -> Self {
        Self {
            method,
            function: function.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            source_ip: None,
        }
    }

    /// POST with a JSON body
    pub fn post_json(function: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut req = Self::new(Method::POST, function);
        req.headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        req.body = body.into();
        req
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = header::HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Header value as text, if present and valid ASCII
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE)
    }

    pub fn origin(&self) -> Option<&str> {
        self.header(header::ORIGIN)
    }
}

/// Resolve the client address from proxy headers, then the socket.
///
/// Order: first `X-Forwarded-For` entry, `X-Real-IP`, connection address.
pub fn extract_client_ip(headers: &HeaderMap, connect: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    if forwarded.is_some() {
        return forwarded;
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());
    if real_ip.is_some() {
        return real_ip;
    }

    connect.map(|addr| addr.ip())
}
