//! Authenticated actor resolved by an [`Authenticator`](crate::middleware::auth::Authenticator).

use serde::{Deserialize, Serialize};

/// Verified principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user identifier
    pub user_id: String,
    /// Tenant the user acts for
    pub organization_id: Option<String>,
    pub email: Option<String>,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: None,
            email: None,
            roles: Vec::new(),
        }
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
