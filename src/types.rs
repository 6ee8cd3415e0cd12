use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Provenance of the key a request ends up using.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    User,
    Admin,
}

impl KeySource {
    pub fn as_str(self) -> &'static str {
        match self {
            KeySource::User => "user",
            KeySource::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "user" => Some(KeySource::User),
            "admin" => Some(KeySource::Admin),
            _ => None,
        }
    }
}

/// A user's provider key as persisted in their profile document.
///
/// `encrypted_key` and `key_hash` are always written together; the plaintext
/// never is.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredential {
    pub encrypted_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub key_hash: String,
    pub is_valid: bool,
    pub key_source: KeySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limited_until_ms: Option<u64>,
}

impl std::fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredential")
            .field("encrypted_key", &"<redacted>")
            .field("salt", &"<redacted>")
            .field("key_hash", &self.masked_key())
            .field("is_valid", &self.is_valid)
            .field("key_source", &self.key_source)
            .field("added_at_ms", &self.added_at_ms)
            .field("last_validated_at_ms", &self.last_validated_at_ms)
            .field("expires_at_ms", &self.expires_at_ms)
            .field("rate_limited_until_ms", &self.rate_limited_until_ms)
            .finish()
    }
}

impl UserCredential {
    pub fn masked_key(&self) -> String {
        let prefix: String = self.key_hash.chars().take(12).collect();
        format!("sha256:{prefix}")
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|expires| expires <= now_ms)
    }

    pub fn is_rate_limited(&self, now_ms: u64) -> bool {
        self.rate_limited_until_ms.is_some_and(|until| until > now_ms)
    }
}

/// Partial update applied to an existing credential without re-encrypting it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialPatch {
    pub is_valid: Option<bool>,
    pub last_validated_at_ms: Option<u64>,
    pub rate_limited_until_ms: Option<Option<u64>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub has_key: bool,
    pub source: Option<KeySource>,
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masked_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

impl CredentialStatus {
    pub fn missing() -> Self {
        Self {
            has_key: false,
            source: None,
            is_valid: false,
            masked_key: None,
            added_at_ms: None,
            last_validated_at_ms: None,
            expires_at_ms: None,
        }
    }
}

/// Situations in which an admin override may stand in for the user's key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    MissingKey,
    RateLimitExceeded,
    KeyExpired,
}

impl TriggerCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerCondition::MissingKey => "missing_key",
            TriggerCondition::RateLimitExceeded => "rate_limit_exceeded",
            TriggerCondition::KeyExpired => "key_expired",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideConditions {
    #[serde(default)]
    pub on_missing_key: bool,
    #[serde(default)]
    pub on_rate_limit_exceeded: bool,
    #[serde(default)]
    pub on_key_expired: bool,
}

impl OverrideConditions {
    pub fn allows(&self, condition: TriggerCondition) -> bool {
        match condition {
            TriggerCondition::MissingKey => self.on_missing_key,
            TriggerCondition::RateLimitExceeded => self.on_rate_limit_exceeded,
            TriggerCondition::KeyExpired => self.on_key_expired,
        }
    }

    pub fn any(&self) -> bool {
        self.on_missing_key || self.on_rate_limit_exceeded || self.on_key_expired
    }
}

/// Admin-supplied part of an override; the registry stamps the rest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideConfig {
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(default)]
    pub conditions: OverrideConditions,
    #[serde(default)]
    pub notify_user: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminOverride {
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub activated_by: String,
    pub activated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
    #[serde(default)]
    pub conditions: OverrideConditions,
    #[serde(default)]
    pub notify_user: bool,
}

impl AdminOverride {
    /// An override past its expiry is inactive regardless of `is_active`.
    pub fn is_in_effect(&self, now_ms: u64) -> bool {
        self.is_active && !self.expires_at_ms.is_some_and(|expires| expires <= now_ms)
    }

    pub fn applies_to(&self, condition: TriggerCondition, now_ms: u64) -> bool {
        self.is_in_effect(now_ms) && self.conditions.allows(condition)
    }
}

/// One billable provider call. Never mutated once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd_micros: u64,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Usage fields as reported by a caller, before normalization.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub total_tokens: u64,
    pub total_cost_usd_micros: u64,
    pub request_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: String,
    pub total_tokens: u64,
    pub total_cost_usd_micros: u64,
    pub request_count: u64,
    #[serde(default)]
    pub model_breakdown: BTreeMap<String, ModelUsage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyUsage {
    pub month: String,
    pub total_tokens: u64,
    pub total_cost_usd_micros: u64,
    pub request_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub all_time_tokens: u64,
    pub all_time_cost_usd_micros: u64,
    pub all_time_requests: u64,
    pub current_month_tokens: u64,
    pub current_month_cost_usd_micros: u64,
}

/// Per-user rollups derived from the usage events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    #[serde(default)]
    pub daily: Vec<DailyUsage>,
    #[serde(default)]
    pub monthly: Vec<MonthlyUsage>,
    #[serde(default)]
    pub totals: UsageTotals,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_cost_usd_micros: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_cost_usd_micros: Option<u64>,
}

impl UsageLimits {
    pub fn limit(&self, limit_type: LimitType) -> Option<u64> {
        match limit_type {
            LimitType::DailyTokens => self.daily_tokens,
            LimitType::DailyCost => self.daily_cost_usd_micros,
            LimitType::MonthlyTokens => self.monthly_tokens,
            LimitType::MonthlyCost => self.monthly_cost_usd_micros,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    DailyTokens,
    DailyCost,
    MonthlyTokens,
    MonthlyCost,
}

/// Outcome of appending a usage event to the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Recorded,
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUsageSummary {
    pub user_id: String,
    pub has_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_source: Option<KeySource>,
    pub override_active: bool,
    pub totals: UsageTotals,
}
