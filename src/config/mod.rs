//! Startup configuration.
//!
//! The file never carries secrets. It names environment variables that are
//! resolved once through [`SecretEnv`] and handed to the components that need them.

mod env;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::auth::{Authorizer, CurrentUser, Role, StaticIdentity};
use crate::cipher::{CipherError, DEFAULT_KDF_ITERATIONS, MasterSecret};
use crate::credentials::{DEFAULT_MIN_KEY_LENGTH, KeyFormatPolicy, ValidationPolicy};
use crate::provider::DEFAULT_BASE_URL;
use crate::types::UsageLimits;
use crate::usage::{PricingTable, PricingTableError};

pub use env::SecretEnv;

pub const DEFAULT_MASTER_SECRET_ENV: &str = "KEYLEDGER_MASTER_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("environment variable {0} is declared blank in the dotenv file")]
    BlankEnv(String),
    #[error("dotenv line {line}: {reason}")]
    Dotenv { line: usize, reason: String },
    #[error("invalid master secret: {0}")]
    MasterSecret(#[from] CipherError),
    #[error("invalid pricing table: {0}")]
    Pricing(#[from] PricingTableError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyledgerConfig {
    #[serde(default)]
    pub cipher: CipherConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub overrides: OverridesConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CipherConfig {
    #[serde(default = "default_master_secret_env")]
    pub master_secret_env: String,
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            master_secret_env: default_master_secret_env(),
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_min_key_length")]
    pub min_key_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_prefix: Option<String>,
    #[serde(default)]
    pub validation: ValidationPolicy,
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            min_key_length: default_min_key_length(),
            required_prefix: None,
            validation: ValidationPolicy::default(),
            provider_base_url: default_provider_base_url(),
            validation_timeout_secs: default_validation_timeout_secs(),
        }
    }
}

impl CredentialsConfig {
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OverridesConfig {
    /// Variable holding the shared key served by active overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_key_env: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageConfig {
    /// LiteLLM-style price map replacing the built-in table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_version: Option<String>,
    #[serde(default)]
    pub default_limits: UsageLimits,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub admin_emails: Vec<String>,
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub token_env: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Role,
}

impl KeyledgerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `.json` files as JSON and everything else as TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cipher.master_secret_env.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "cipher.master_secret_env must not be empty".to_string(),
            ));
        }
        if self.cipher.kdf_iterations == 0 {
            return Err(ConfigError::Invalid(
                "cipher.kdf_iterations must be > 0".to_string(),
            ));
        }
        if self.credentials.min_key_length == 0 {
            return Err(ConfigError::Invalid(
                "credentials.min_key_length must be > 0".to_string(),
            ));
        }
        if self.credentials.validation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "credentials.validation_timeout_secs must be > 0".to_string(),
            ));
        }
        for session in &self.auth.sessions {
            if session.user_id.trim().is_empty() || session.token_env.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "auth.sessions entries need user_id and token_env".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn master_secret(&self, env: &SecretEnv) -> Result<MasterSecret, ConfigError> {
        let value = env.secret(&self.cipher.master_secret_env)?;
        Ok(MasterSecret::new(value.as_str())?)
    }

    /// `None` when no shared key is configured; an error when one is named
    /// but unset.
    pub fn shared_key(&self, env: &SecretEnv) -> Result<Option<Zeroizing<String>>, ConfigError> {
        let Some(name) = self
            .overrides
            .shared_key_env
            .as_deref()
            .filter(|name| !name.trim().is_empty())
        else {
            return Ok(None);
        };
        Ok(Some(env.secret(name)?))
    }

    pub fn identity(&self, env: &SecretEnv) -> Result<StaticIdentity, ConfigError> {
        let mut identity = StaticIdentity::new();
        for session in &self.auth.sessions {
            let token = env.secret(&session.token_env)?;
            let mut user = CurrentUser::new(session.user_id.trim()).with_role(session.role);
            if let Some(email) = session.email.as_deref() {
                user = user.with_email(email);
            }
            identity = identity.with_session(token.as_str(), user);
        }
        Ok(identity)
    }

    pub fn authorizer(&self) -> Authorizer {
        Authorizer::new(&self.auth.admin_emails)
    }

    pub fn key_format(&self) -> KeyFormatPolicy {
        KeyFormatPolicy {
            min_length: self.credentials.min_key_length,
            required_prefix: self
                .credentials
                .required_prefix
                .clone()
                .filter(|prefix| !prefix.trim().is_empty()),
        }
    }

    pub fn pricing_table(&self) -> Result<PricingTable, ConfigError> {
        let Some(path) = self.usage.pricing_file.as_deref() else {
            return Ok(PricingTable::builtin());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let version = self
            .usage
            .pricing_version
            .clone()
            .unwrap_or_else(|| path.display().to_string());
        Ok(PricingTable::from_litellm_json_str(&version, &raw)?)
    }
}

fn default_master_secret_env() -> String {
    DEFAULT_MASTER_SECRET_ENV.to_string()
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

fn default_min_key_length() -> usize {
    DEFAULT_MIN_KEY_LENGTH
}

fn default_provider_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_validation_timeout_secs() -> u64 {
    10
}
