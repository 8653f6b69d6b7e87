//! Authentication and role authorization.
//!
//! Token verification is external: an [`Authenticator`] turns a request into
//! a verified [`Principal`] or nothing. [`ApiKeyAuthenticator`] is a ready
//! implementation for static API keys. [`authorize`] applies a route's role
//! requirements to the principal.

use async_trait::async_trait;
use tracing::debug;

use crate::domain::error::GuardError;
use crate::domain::principal::Principal;
use crate::domain::request::InboundRequest;

/// Resolves the verified principal behind a request
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` means the request carries no valid credentials.
    async fn authenticate(&self, request: &InboundRequest) -> Option<Principal>;
}

/// Static API keys mapped to principals
#[derive(Clone, Default)]
pub struct ApiKeyAuthenticator {
    keys: Vec<(String, Principal)>,
}

impl ApiKeyAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>, principal: Principal) -> Self {
        self.keys.push((key.into(), principal));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for ApiKeyAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuthenticator")
            .field("keys", &self.keys.len())
            .finish()
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, request: &InboundRequest) -> Option<Principal> {
        let presented = presented_key(request)?;

        // Compare against every key so timing does not reveal the position
        let mut matched = None;
        for (key, principal) in &self.keys {
            if constant_time_compare(presented, key) && matched.is_none() {
                matched = Some(principal.clone());
            }
        }

        if matched.is_none() {
            debug!(function = %request.function, "Presented API key did not match");
        }
        matched
    }
}

/// Key from `Authorization: Bearer` or `X-API-Key`
fn presented_key(request: &InboundRequest) -> Option<&str> {
    if let Some(auth) = request.header("authorization") {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.trim());
        }
    }
    request.header("x-api-key").map(str::trim)
}

/// Constant-time string comparison.
///
/// Both inputs are padded to the same length with different fill bytes, so
/// unequal lengths never compare equal and the loop length leaks only the
/// longer input's size.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;

    let max_len = a.len().max(b.len());
    let mut a_padded = vec![0u8; max_len];
    let mut b_padded = vec![0xFFu8; max_len];
    a_padded[..a.len()].copy_from_slice(a.as_bytes());
    b_padded[..b.len()].copy_from_slice(b.as_bytes());

    let lengths_equal = a.len().ct_eq(&b.len());
    let contents_equal = a_padded.ct_eq(&b_padded);
    (lengths_equal & contents_equal).into()
}

/// Check role requirements.
///
/// The principal needs every role in `all_of` and at least one role in
/// `any_of` (when non-empty). A principal holding `superuser_role` passes
/// every check.
pub fn authorize(
    principal: &Principal,
    all_of: &[String],
    any_of: &[String],
    superuser_role: Option<&str>,
) -> Result<(), GuardError> {
    if superuser_role.is_some_and(|role| principal.has_role(role)) {
        return Ok(());
    }

    let missing: Vec<&str> = all_of
        .iter()
        .filter(|role| !principal.has_role(role))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(GuardError::forbidden(format!(
            "missing required role(s): {}",
            missing.join(", ")
        )));
    }

    if !any_of.is_empty() && !any_of.iter().any(|role| principal.has_role(role)) {
        return Err(GuardError::forbidden(format!(
            "requires one of: {}",
            any_of.join(", ")
        )));
    }

    Ok(())
}
