use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::credentials::CredentialError;
use crate::overrides::OverrideError;
use crate::resolver::ResolutionError;
use crate::store::StoreError;
use crate::usage::UsageError;

#[derive(Debug, Error)]
pub enum KeyledgerError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Override(#[from] OverrideError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl KeyledgerError {
    /// Whether the caller may retry the same operation with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            KeyledgerError::Store(err) => err.is_retryable(),
            KeyledgerError::Credential(CredentialError::Store(err)) => err.is_retryable(),
            KeyledgerError::Override(OverrideError::Store(err)) => err.is_retryable(),
            KeyledgerError::Resolution(ResolutionError::Store(err)) => err.is_retryable(),
            KeyledgerError::Usage(UsageError::Store(err)) => err.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, KeyledgerError>;
