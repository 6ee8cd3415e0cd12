//! Identity and the single admin check.
//!
//! Authentication belongs to an external identity provider; this module only
//! models what it hands back and turns an admin role into an [`AdminGrant`]
//! that admin-only operations require as a parameter.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Admin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Role,
}

impl CurrentUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            role: Role::User,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("admin role required")]
    Forbidden,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolves a bearer token to the signed-in user.
    async fn current_user(&self, bearer_token: Option<&str>) -> Result<CurrentUser, AuthError>;
}

/// Token-to-user table loaded at startup.
#[derive(Clone, Default)]
pub struct StaticIdentity {
    sessions: HashMap<String, CurrentUser>,
}

impl std::fmt::Debug for StaticIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let users: Vec<&str> = self.sessions.values().map(|user| user.id.as_str()).collect();
        f.debug_struct("StaticIdentity")
            .field("users", &users)
            .finish_non_exhaustive()
    }
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, token: impl Into<String>, user: CurrentUser) -> Self {
        self.sessions.insert(token.into(), user);
        self
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self, bearer_token: Option<&str>) -> Result<CurrentUser, AuthError> {
        let token = bearer_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::Unauthenticated)?;
        self.sessions
            .get(token)
            .cloned()
            .ok_or(AuthError::Unauthenticated)
    }
}

/// Proof that an admin check passed. Only [`Authorizer::require_admin`]
/// creates one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminGrant {
    admin_id: String,
}

impl AdminGrant {
    pub fn admin_id(&self) -> &str {
        &self.admin_id
    }

    #[cfg(test)]
    pub(crate) fn for_tests(admin_id: &str) -> Self {
        Self {
            admin_id: admin_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Authorizer {
    admin_emails: HashSet<String>,
}

impl Authorizer {
    pub fn new<I, S>(admin_emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            admin_emails: admin_emails
                .into_iter()
                .map(|email| email.as_ref().trim().to_ascii_lowercase())
                .filter(|email| !email.is_empty())
                .collect(),
        }
    }

    pub fn role_of(&self, user: &CurrentUser) -> Role {
        if user.role == Role::Admin {
            return Role::Admin;
        }
        let listed = user
            .email
            .as_deref()
            .map(|email| email.trim().to_ascii_lowercase())
            .is_some_and(|email| self.admin_emails.contains(&email));
        if listed { Role::Admin } else { Role::User }
    }

    pub fn require_admin(&self, user: &CurrentUser) -> Result<AdminGrant, AuthError> {
        match self.role_of(user) {
            Role::Admin => Ok(AdminGrant {
                admin_id: user.id.clone(),
            }),
            Role::User => {
                tracing::debug!(user_id = %user.id, "admin check denied");
                Err(AuthError::Forbidden)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_by_role_or_listed_email() {
        let authorizer = Authorizer::new(["Ops@Example.com"]);

        let by_role = CurrentUser::new("a1").with_role(Role::Admin);
        assert_eq!(
            authorizer.require_admin(&by_role).expect("admin").admin_id(),
            "a1"
        );

        let by_email = CurrentUser::new("a2").with_email("ops@example.com ");
        assert_eq!(authorizer.role_of(&by_email), Role::Admin);

        let plain = CurrentUser::new("u1").with_email("someone@example.com");
        assert_eq!(authorizer.require_admin(&plain), Err(AuthError::Forbidden));
    }

    #[tokio::test]
    async fn static_identity_resolves_known_tokens_only() {
        let identity = StaticIdentity::new().with_session("tok-1", CurrentUser::new("u1"));
        assert_eq!(
            identity.current_user(Some("tok-1")).await.expect("user").id,
            "u1"
        );
        assert_eq!(
            identity.current_user(Some("nope")).await,
            Err(AuthError::Unauthenticated)
        );
        assert_eq!(
            identity.current_user(None).await,
            Err(AuthError::Unauthenticated)
        );
        assert!(!format!("{identity:?}").contains("tok-1"));
    }
}
