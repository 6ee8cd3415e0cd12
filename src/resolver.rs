//! Picks the key a request will use: the user's own key first, an admin
//! override second, otherwise a typed failure.

use std::sync::Arc;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::credentials::{CredentialError, CredentialStore};
use crate::overrides::{OverrideError, OverrideRegistry};
use crate::store::StoreError;
use crate::types::{AdminOverride, KeySource, TriggerCondition, UserCredential};

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no usable api key ({})", .condition.as_str())]
    NoValidKey {
        condition: TriggerCondition,
        /// The stored key exists but cannot be decrypted; the user must enter it again.
        reentry_required: bool,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolutionError::Store(err) if err.is_retryable())
    }
}

impl From<OverrideError> for ResolutionError {
    fn from(err: OverrideError) -> Self {
        match err {
            OverrideError::Store(err) => ResolutionError::Store(err),
            OverrideError::MissingField(_) => ResolutionError::NoValidKey {
                condition: TriggerCondition::MissingKey,
                reentry_required: false,
            },
        }
    }
}

/// A decrypted key, valid for one downstream call.
pub struct UsableKey {
    key: Zeroizing<String>,
    source: KeySource,
    notify_user: bool,
    condition: Option<TriggerCondition>,
}

impl std::fmt::Debug for UsableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsableKey")
            .field("key", &"<redacted>")
            .field("source", &self.source)
            .field("notify_user", &self.notify_user)
            .field("condition", &self.condition)
            .finish()
    }
}

impl UsableKey {
    pub fn expose(&self) -> &str {
        self.key.as_str()
    }

    pub fn source(&self) -> KeySource {
        self.source
    }

    /// Set when an override with `notify_user` supplied the key.
    pub fn notify_user(&self) -> bool {
        self.notify_user
    }

    /// Why the user's own key was not used, for admin-sourced keys.
    pub fn condition(&self) -> Option<TriggerCondition> {
        self.condition
    }
}

pub struct CredentialResolver {
    credentials: Arc<CredentialStore>,
    overrides: Arc<OverrideRegistry>,
    clock: Arc<dyn Clock>,
    shared_key: Option<Arc<Zeroizing<String>>>,
}

impl CredentialResolver {
    pub fn new(
        credentials: Arc<CredentialStore>,
        overrides: Arc<OverrideRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            credentials,
            overrides,
            clock,
            shared_key: None,
        }
    }

    /// Key served by every active override. Without one, an override uses
    /// the stored key of the admin who activated it.
    pub fn with_shared_key(mut self, key: Zeroizing<String>) -> Self {
        self.shared_key = Some(Arc::new(key));
        self
    }

    /// Never mutates stored state.
    pub async fn resolve_key_for_use(&self, user_id: &str) -> Result<UsableKey, ResolutionError> {
        let now_ms = self.clock.now_ms();
        let stored = self
            .credentials
            .credential(user_id)
            .await
            .map_err(credential_failure)?;

        let (condition, reentry_required) = match stored {
            None => (TriggerCondition::MissingKey, false),
            Some(credential) => match unusable_reason(&credential, now_ms) {
                Some(condition) => (condition, false),
                None => match self.credentials.decrypt(user_id, &credential).await {
                    Ok(key) => {
                        return Ok(UsableKey {
                            key,
                            source: KeySource::User,
                            notify_user: false,
                            condition: None,
                        });
                    }
                    Err(CredentialError::Decryption) => (TriggerCondition::MissingKey, true),
                    Err(err) => return Err(credential_failure(err)),
                },
            },
        };

        let Some(active) = self
            .overrides
            .active_override(user_id, condition)
            .await?
        else {
            tracing::debug!(
                user_id,
                condition = condition.as_str(),
                reentry_required,
                "no usable key and no matching override"
            );
            return Err(ResolutionError::NoValidKey {
                condition,
                reentry_required,
            });
        };

        let Some(key) = self.override_key(&active, now_ms).await? else {
            tracing::warn!(
                user_id,
                admin_id = %active.activated_by,
                condition = condition.as_str(),
                "override is active but no shared key is available"
            );
            return Err(ResolutionError::NoValidKey {
                condition,
                reentry_required,
            });
        };

        tracing::info!(
            user_id,
            source = KeySource::Admin.as_str(),
            condition = condition.as_str(),
            "admin override key resolved"
        );
        Ok(UsableKey {
            key,
            source: KeySource::Admin,
            notify_user: active.notify_user,
            condition: Some(condition),
        })
    }

    async fn override_key(
        &self,
        active: &AdminOverride,
        now_ms: u64,
    ) -> Result<Option<Zeroizing<String>>, ResolutionError> {
        if let Some(shared) = self.shared_key.as_ref() {
            return Ok(Some(Zeroizing::new(shared.as_str().to_string())));
        }

        let admin_id = active.activated_by.as_str();
        let Some(credential) = self
            .credentials
            .credential(admin_id)
            .await
            .map_err(credential_failure)?
        else {
            return Ok(None);
        };
        if unusable_reason(&credential, now_ms).is_some() {
            return Ok(None);
        }
        match self.credentials.decrypt(admin_id, &credential).await {
            Ok(key) => Ok(Some(key)),
            Err(CredentialError::Decryption) => Ok(None),
            Err(err) => Err(credential_failure(err)),
        }
    }
}

fn unusable_reason(credential: &UserCredential, now_ms: u64) -> Option<TriggerCondition> {
    if credential.is_expired(now_ms) || !credential.is_valid {
        return Some(TriggerCondition::KeyExpired);
    }
    if credential.is_rate_limited(now_ms) {
        return Some(TriggerCondition::RateLimitExceeded);
    }
    None
}

fn credential_failure(err: CredentialError) -> ResolutionError {
    match err {
        CredentialError::Store(err) => ResolutionError::Store(err),
        other => ResolutionError::NoValidKey {
            condition: TriggerCondition::MissingKey,
            reentry_required: matches!(other, CredentialError::Decryption),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_key_debug_is_redacted() {
        let key = UsableKey {
            key: Zeroizing::new("AIzaSyVerySecretValue0000000".to_string()),
            source: KeySource::User,
            notify_user: false,
            condition: None,
        };
        let debug = format!("{key:?}");
        assert!(!debug.contains("VerySecret"));
        assert_eq!(key.expose(), "AIzaSyVerySecretValue0000000");
    }

    #[test]
    fn invalid_and_expired_keys_map_to_key_expired() {
        let mut credential = UserCredential {
            encrypted_key: vec![0; 32],
            salt: vec![0; 16],
            key_hash: "00".repeat(32),
            is_valid: true,
            key_source: KeySource::User,
            added_at_ms: None,
            last_validated_at_ms: None,
            expires_at_ms: Some(100),
            rate_limited_until_ms: Some(200),
        };
        assert_eq!(unusable_reason(&credential, 50), Some(TriggerCondition::RateLimitExceeded));
        assert_eq!(unusable_reason(&credential, 100), Some(TriggerCondition::KeyExpired));

        credential.expires_at_ms = None;
        credential.is_valid = false;
        assert_eq!(unusable_reason(&credential, 300), Some(TriggerCondition::KeyExpired));

        credential.is_valid = true;
        assert_eq!(unusable_reason(&credential, 300), None);
    }
}
