//! Per-user provider keys, encrypted at rest.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cipher::{CipherError, SecretCipher, fingerprint};
use crate::clock::Clock;
use crate::provider::{KeyCheck, KeyValidator};
use crate::store::{ProfileStore, StoreError};
use crate::types::{CredentialPatch, CredentialStatus, KeySource, UserCredential};

pub const DEFAULT_MIN_KEY_LENGTH: usize = 20;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid api key: {0}")]
    Validation(String),
    #[error("no api key configured")]
    NotFound,
    #[error("stored api key is unreadable; re-enter the key")]
    Decryption,
    #[error("api key cipher failed")]
    Cipher(#[source] CipherError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CredentialError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CredentialError::Store(err) if err.is_retryable())
    }
}

/// How a submitted key is checked before it is stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationPolicy {
    /// Local format check only.
    FormatOnly,
    /// Format check, then one live provider call. An unreachable provider
    /// falls back to the format check.
    #[default]
    LiveWithFallback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyFormatPolicy {
    pub min_length: usize,
    pub required_prefix: Option<String>,
}

impl Default for KeyFormatPolicy {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_KEY_LENGTH,
            required_prefix: None,
        }
    }
}

impl KeyFormatPolicy {
    /// Returns the trimmed key when it passes.
    pub fn check<'a>(&self, raw: &'a str) -> Result<&'a str, CredentialError> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(CredentialError::Validation("api key is required".to_string()));
        }
        if key.chars().any(char::is_whitespace) {
            return Err(CredentialError::Validation(
                "api key must not contain whitespace".to_string(),
            ));
        }
        if key.chars().count() < self.min_length {
            return Err(CredentialError::Validation(format!(
                "api key must be at least {} characters",
                self.min_length
            )));
        }
        if let Some(prefix) = self.required_prefix.as_deref() {
            if !key.starts_with(prefix) {
                return Err(CredentialError::Validation(format!(
                    "api key must start with {prefix}"
                )));
            }
        }
        Ok(key)
    }
}

pub struct CredentialStore {
    store: Arc<dyn ProfileStore>,
    cipher: SecretCipher,
    clock: Arc<dyn Clock>,
    format: KeyFormatPolicy,
    policy: ValidationPolicy,
    validator: Option<Arc<dyn KeyValidator>>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn ProfileStore>, cipher: SecretCipher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            cipher,
            clock,
            format: KeyFormatPolicy::default(),
            policy: ValidationPolicy::FormatOnly,
            validator: None,
        }
    }

    pub fn with_format_policy(mut self, format: KeyFormatPolicy) -> Self {
        self.format = format;
        self
    }

    pub fn with_live_validation(mut self, validator: Arc<dyn KeyValidator>) -> Self {
        self.policy = ValidationPolicy::LiveWithFallback;
        self.validator = Some(validator);
        self
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        self.policy
    }

    /// Validates, encrypts and stores the user's key, replacing any previous one.
    pub async fn set_credential(
        &self,
        user_id: &str,
        plaintext_key: &str,
        expires_at_ms: Option<u64>,
    ) -> Result<CredentialStatus, CredentialError> {
        let key = self.format.check(plaintext_key)?;
        let now_ms = self.clock.now_ms();
        if expires_at_ms.is_some_and(|expires| expires <= now_ms) {
            return Err(CredentialError::Validation(
                "expiry must be in the future".to_string(),
            ));
        }

        let last_validated_at_ms = self.live_check(user_id, key, now_ms).await?;

        let sealed = self
            .cipher
            .seal(key)
            .await
            .map_err(CredentialError::Cipher)?;
        let credential = UserCredential {
            encrypted_key: sealed.ciphertext,
            salt: sealed.salt,
            key_hash: fingerprint(key),
            is_valid: true,
            key_source: KeySource::User,
            added_at_ms: Some(now_ms),
            last_validated_at_ms,
            expires_at_ms,
            rate_limited_until_ms: None,
        };
        self.store.put_credential(user_id, &credential).await?;

        tracing::info!(
            user_id,
            masked_key = %credential.masked_key(),
            live_validated = last_validated_at_ms.is_some(),
            "api key stored"
        );
        Ok(status_of(&credential))
    }

    async fn live_check(
        &self,
        user_id: &str,
        key: &str,
        now_ms: u64,
    ) -> Result<Option<u64>, CredentialError> {
        let Some(validator) = self.validator.as_ref() else {
            return Ok(None);
        };
        if self.policy != ValidationPolicy::LiveWithFallback {
            return Ok(None);
        }

        match validator.check_key(key).await {
            KeyCheck::Valid => Ok(Some(now_ms)),
            KeyCheck::Rejected { status } => {
                tracing::info!(user_id, status, "provider rejected submitted api key");
                Err(CredentialError::Validation(
                    "the provider rejected this api key".to_string(),
                ))
            }
            KeyCheck::Unreachable { reason } => {
                tracing::warn!(
                    user_id,
                    %reason,
                    "key validation unavailable; accepted on format check"
                );
                Ok(None)
            }
        }
    }

    /// Stored record without decrypting it.
    pub async fn credential(&self, user_id: &str) -> Result<Option<UserCredential>, CredentialError> {
        Ok(self.store.credential(user_id).await?)
    }

    pub async fn get_decrypted_credential(
        &self,
        user_id: &str,
    ) -> Result<Zeroizing<String>, CredentialError> {
        let credential = self
            .store
            .credential(user_id)
            .await?
            .ok_or(CredentialError::NotFound)?;
        self.decrypt(user_id, &credential).await
    }

    pub(crate) async fn decrypt(
        &self,
        user_id: &str,
        credential: &UserCredential,
    ) -> Result<Zeroizing<String>, CredentialError> {
        match self
            .cipher
            .open(&credential.encrypted_key, &credential.salt)
            .await
        {
            Ok(key) => Ok(key),
            Err(CipherError::Decryption) => {
                tracing::warn!(
                    user_id,
                    masked_key = %credential.masked_key(),
                    "stored api key failed to decrypt"
                );
                Err(CredentialError::Decryption)
            }
            Err(err) => Err(CredentialError::Cipher(err)),
        }
    }

    pub async fn get_credential_status(
        &self,
        user_id: &str,
    ) -> Result<CredentialStatus, CredentialError> {
        let status = self
            .store
            .credential(user_id)
            .await?
            .map(|credential| status_of(&credential))
            .unwrap_or_else(CredentialStatus::missing);
        Ok(status)
    }

    /// Idempotent; reports whether a key existed.
    pub async fn remove_credential(&self, user_id: &str) -> Result<bool, CredentialError> {
        let removed = self.store.delete_credential(user_id).await?;
        if removed {
            tracing::info!(user_id, "api key removed");
        }
        Ok(removed)
    }

    /// Flags the stored key as rejected by the provider.
    pub async fn mark_invalid(&self, user_id: &str) -> Result<bool, CredentialError> {
        let patch = CredentialPatch {
            is_valid: Some(false),
            last_validated_at_ms: Some(self.clock.now_ms()),
            ..CredentialPatch::default()
        };
        let patched = self.store.patch_credential(user_id, &patch).await?;
        if patched {
            tracing::info!(user_id, "api key marked invalid");
        }
        Ok(patched)
    }

    pub async fn mark_rate_limited(
        &self,
        user_id: &str,
        until_ms: u64,
    ) -> Result<bool, CredentialError> {
        let patch = CredentialPatch {
            rate_limited_until_ms: Some(Some(until_ms)),
            ..CredentialPatch::default()
        };
        let patched = self.store.patch_credential(user_id, &patch).await?;
        if patched {
            tracing::info!(user_id, until_ms, "api key rate limited");
        }
        Ok(patched)
    }
}

fn status_of(credential: &UserCredential) -> CredentialStatus {
    CredentialStatus {
        has_key: true,
        source: Some(credential.key_source),
        is_valid: credential.is_valid,
        masked_key: Some(credential.masked_key()),
        added_at_ms: credential.added_at_ms,
        last_validated_at_ms: credential.last_validated_at_ms,
        expires_at_ms: credential.expires_at_ms,
    }
}
