//! The operations exposed to routes, wired from the components below.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::auth::AdminGrant;
use crate::cipher::SecretCipher;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, KeyledgerConfig, SecretEnv};
use crate::credentials::{CredentialStore, KeyFormatPolicy, ValidationPolicy};
use crate::overrides::OverrideRegistry;
use crate::provider::{GeminiKeyValidator, KeyValidator};
use crate::resolver::{CredentialResolver, UsableKey};
use crate::store::{DayRange, ProfileStore};
use crate::types::{
    AdminOverride, AppendOutcome, CredentialStatus, KeySource, LimitType, OverrideConfig,
    TriggerCondition, UsageEvent, UsageLimits, UsageMetrics, UsageReport, UserUsageSummary,
};
use crate::usage::{PricingTable, UsageAggregator};
use crate::{KeyledgerError, Result};

/// Back-off recorded when the provider rate-limits a key without saying for how long.
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// Provider feedback about a stored key, reported after a failed call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyFailure {
    Rejected,
    RateLimited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
}

pub struct KeyServiceBuilder {
    store: Arc<dyn ProfileStore>,
    cipher: SecretCipher,
    clock: Arc<dyn Clock>,
    key_format: KeyFormatPolicy,
    validator: Option<Arc<dyn KeyValidator>>,
    shared_key: Option<Zeroizing<String>>,
    pricing: PricingTable,
    default_limits: UsageLimits,
}

impl KeyServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key_format(mut self, key_format: KeyFormatPolicy) -> Self {
        self.key_format = key_format;
        self
    }

    pub fn live_validation(mut self, validator: Arc<dyn KeyValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn shared_key(mut self, key: Zeroizing<String>) -> Self {
        self.shared_key = Some(key);
        self
    }

    pub fn pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn default_limits(mut self, limits: UsageLimits) -> Self {
        self.default_limits = limits;
        self
    }

    pub fn build(self) -> KeyService {
        let mut credentials =
            CredentialStore::new(self.store.clone(), self.cipher, self.clock.clone())
                .with_format_policy(self.key_format);
        if let Some(validator) = self.validator {
            credentials = credentials.with_live_validation(validator);
        }
        let credentials = Arc::new(credentials);
        let overrides = Arc::new(OverrideRegistry::new(self.store.clone(), self.clock.clone()));

        let mut resolver =
            CredentialResolver::new(credentials.clone(), overrides.clone(), self.clock.clone());
        if let Some(key) = self.shared_key {
            resolver = resolver.with_shared_key(key);
        }

        let usage = UsageAggregator::new(
            self.store.clone(),
            Arc::new(self.pricing),
            self.clock.clone(),
        )
        .with_default_limits(self.default_limits);

        KeyService {
            store: self.store,
            clock: self.clock,
            credentials,
            overrides,
            resolver: Arc::new(resolver),
            usage: Arc::new(usage),
        }
    }
}

#[derive(Clone)]
pub struct KeyService {
    store: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    credentials: Arc<CredentialStore>,
    overrides: Arc<OverrideRegistry>,
    resolver: Arc<CredentialResolver>,
    usage: Arc<UsageAggregator>,
}

impl std::fmt::Debug for KeyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyService")
            .field("validation", &self.credentials.validation_policy())
            .field("pricing_version", &self.usage.pricing().version())
            .finish_non_exhaustive()
    }
}

impl KeyService {
    pub fn builder(store: Arc<dyn ProfileStore>, cipher: SecretCipher) -> KeyServiceBuilder {
        KeyServiceBuilder {
            store,
            cipher,
            clock: Arc::new(SystemClock),
            key_format: KeyFormatPolicy::default(),
            validator: None,
            shared_key: None,
            pricing: PricingTable::builtin(),
            default_limits: UsageLimits::default(),
        }
    }

    /// Wires every component from config, reading secrets through `env`.
    pub fn from_config(
        config: &KeyledgerConfig,
        env: &SecretEnv,
        store: Arc<dyn ProfileStore>,
    ) -> std::result::Result<Self, ConfigError> {
        let cipher = SecretCipher::new(config.master_secret(env)?)
            .with_kdf_iterations(config.cipher.kdf_iterations);
        let mut builder = Self::builder(store, cipher)
            .key_format(config.key_format())
            .pricing(config.pricing_table()?)
            .default_limits(config.usage.default_limits);

        if config.credentials.validation == ValidationPolicy::LiveWithFallback {
            let validator = GeminiKeyValidator::new(config.credentials.validation_timeout())
                .with_base_url(config.credentials.provider_base_url.clone());
            builder = builder.live_validation(Arc::new(validator));
        }
        if let Some(key) = config.shared_key(env)? {
            builder = builder.shared_key(key);
        }
        Ok(builder.build())
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn overrides(&self) -> &OverrideRegistry {
        &self.overrides
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    pub fn usage_aggregator(&self) -> &UsageAggregator {
        &self.usage
    }

    /// Reports `source = admin` for a user without a key whose override
    /// covers the missing-key case.
    pub async fn key_status(&self, user_id: &str) -> Result<CredentialStatus> {
        let mut status = self.credentials.get_credential_status(user_id).await?;
        if !status.has_key
            && self
                .overrides
                .resolve_override(user_id, TriggerCondition::MissingKey)
                .await?
        {
            status.source = Some(KeySource::Admin);
        }
        Ok(status)
    }

    pub async fn set_key(
        &self,
        user_id: &str,
        plaintext_key: &str,
        expires_at_ms: Option<u64>,
    ) -> Result<CredentialStatus> {
        Ok(self
            .credentials
            .set_credential(user_id, plaintext_key, expires_at_ms)
            .await?)
    }

    pub async fn remove_key(&self, user_id: &str) -> Result<bool> {
        Ok(self.credentials.remove_credential(user_id).await?)
    }

    /// Returns `false` when the user has no stored key to flag.
    pub async fn report_key_failure(&self, user_id: &str, failure: KeyFailure) -> Result<bool> {
        let marked = match failure {
            KeyFailure::Rejected => self.credentials.mark_invalid(user_id).await?,
            KeyFailure::RateLimited { retry_after_secs } => {
                let backoff = retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF);
                let backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
                let until_ms = self.clock.now_ms().saturating_add(backoff_ms);
                self.credentials.mark_rate_limited(user_id, until_ms).await?
            }
        };
        Ok(marked)
    }

    pub async fn resolve_key_for_use(&self, user_id: &str) -> Result<UsableKey> {
        Ok(self.resolver.resolve_key_for_use(user_id).await?)
    }

    pub async fn log_usage(&self, user_id: &str, report: UsageReport) -> Result<AppendOutcome> {
        Ok(self.usage.record_usage(user_id, report).await?)
    }

    pub async fn usage(&self, user_id: &str, range: &DayRange) -> Result<Vec<UsageEvent>> {
        Ok(self.usage.usage(user_id, range).await?)
    }

    pub async fn usage_metrics(&self, user_id: &str) -> Result<UsageMetrics> {
        Ok(self.usage.metrics(user_id).await?)
    }

    pub async fn is_over_limit(&self, user_id: &str, limit_type: LimitType) -> Result<bool> {
        Ok(self.usage.is_over_limit(user_id, limit_type).await?)
    }

    pub async fn all_users_usage(&self, _grant: &AdminGrant) -> Result<Vec<UserUsageSummary>> {
        let now_ms = self.clock.now_ms();
        let user_ids = self.store.user_ids().await.map_err(KeyledgerError::from)?;

        let mut summaries = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let credential = self.credentials.credential(&user_id).await?;
            let override_active = self
                .overrides
                .get_override(&user_id)
                .await?
                .is_some_and(|value| value.is_in_effect(now_ms));
            let metrics = self.usage.metrics(&user_id).await?;
            summaries.push(UserUsageSummary {
                has_key: credential.is_some(),
                key_source: credential.map(|credential| credential.key_source),
                override_active,
                totals: metrics.totals,
                user_id,
            });
        }
        Ok(summaries)
    }

    pub async fn user_usage(&self, user_id: &str, _grant: &AdminGrant) -> Result<UsageMetrics> {
        self.usage_metrics(user_id).await
    }

    pub async fn get_override(
        &self,
        user_id: &str,
        _grant: &AdminGrant,
    ) -> Result<Option<AdminOverride>> {
        Ok(self.overrides.get_override(user_id).await?)
    }

    pub async fn set_override(
        &self,
        target_user_id: &str,
        config: OverrideConfig,
        grant: &AdminGrant,
    ) -> Result<AdminOverride> {
        Ok(self
            .overrides
            .set_override(target_user_id, config, grant)
            .await?)
    }

    pub async fn remove_override(&self, target_user_id: &str, grant: &AdminGrant) -> Result<bool> {
        Ok(self.overrides.remove_override(target_user_id, grant).await?)
    }

    pub async fn set_usage_limits(
        &self,
        target_user_id: &str,
        limits: UsageLimits,
        grant: &AdminGrant,
    ) -> Result<()> {
        Ok(self
            .usage
            .set_usage_limits(target_user_id, limits, grant)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::MasterSecret;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::OverrideConditions;

    const KEY: &str = "AIzaSyA1b2C3d4E5f6G7h8I9j0KlMnOpQrStU";

    fn service(clock: &ManualClock) -> KeyService {
        let cipher = SecretCipher::new(MasterSecret::new("service-secret").expect("secret"))
            .with_kdf_iterations(1_000);
        KeyService::builder(Arc::new(MemoryStore::new()), cipher)
            .clock(Arc::new(clock.clone()))
            .build()
    }

    #[tokio::test]
    async fn from_config_reads_secrets_from_dotenv() {
        let config = KeyledgerConfig::from_toml_str(
            r#"
            [cipher]
            master_secret_env = "LEDGER_MASTER"
            kdf_iterations = 1000

            [credentials]
            validation = "format-only"

            [overrides]
            shared_key_env = "LEDGER_SHARED"
            "#,
        )
        .expect("config");

        let env = SecretEnv::from_dotenv_str(
            "LEDGER_MASTER=from-dotenv\nLEDGER_SHARED='AIzaSySharedAdminKey000000000000000'\n",
        )
        .expect("dotenv");
        let service =
            KeyService::from_config(&config, &env, Arc::new(MemoryStore::new())).expect("service");
        service.set_key("u1", KEY, None).await.expect("set");
        assert_eq!(
            service.resolve_key_for_use("u1").await.expect("resolve").expose(),
            KEY
        );

        let blank = SecretEnv::from_dotenv_str("LEDGER_MASTER=\n").expect("dotenv");
        let err = KeyService::from_config(&config, &blank, Arc::new(MemoryStore::new()))
            .err()
            .expect("blank master secret");
        assert!(matches!(err, ConfigError::BlankEnv(name) if name == "LEDGER_MASTER"));
    }

    #[test]
    fn key_failure_json_shape() {
        let failure: KeyFailure =
            serde_json::from_str(r#"{"kind":"rate_limited","retry_after_secs":30}"#).expect("json");
        assert_eq!(
            failure,
            KeyFailure::RateLimited {
                retry_after_secs: Some(30)
            }
        );
        let failure: KeyFailure = serde_json::from_str(r#"{"kind":"rejected"}"#).expect("json");
        assert_eq!(failure, KeyFailure::Rejected);
    }

    #[tokio::test]
    async fn rate_limit_report_uses_default_backoff() {
        let clock = ManualClock::new(1_000);
        let service = service(&clock);
        service.set_key("u1", KEY, None).await.expect("set");
        assert!(service
            .report_key_failure("u1", KeyFailure::RateLimited { retry_after_secs: None })
            .await
            .expect("report"));
        let stored = service
            .credentials()
            .credential("u1")
            .await
            .expect("get")
            .expect("some");
        assert_eq!(stored.rate_limited_until_ms, Some(61_000));
    }

    #[tokio::test]
    async fn status_reports_admin_source_for_covered_missing_key() {
        let clock = ManualClock::new(1_000);
        let service = service(&clock);
        let grant = AdminGrant::for_tests("admin-1");
        service
            .set_override(
                "u1",
                OverrideConfig {
                    is_active: true,
                    conditions: OverrideConditions {
                        on_missing_key: true,
                        ..OverrideConditions::default()
                    },
                    ..OverrideConfig::default()
                },
                &grant,
            )
            .await
            .expect("override");

        let status = service.key_status("u1").await.expect("status");
        assert!(!status.has_key);
        assert_eq!(status.source, Some(KeySource::Admin));

        let summaries = service.all_users_usage(&grant).await.expect("summaries");
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].override_active);
        assert!(!summaries[0].has_key);
    }
}
