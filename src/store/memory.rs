use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{DayRange, ProfileStore, StoreError};
use crate::types::{
    AdminOverride, AppendOutcome, CredentialPatch, UsageEvent, UsageLimits, UsageMetrics,
    UserCredential,
};
use crate::usage::rollup::day_key;

/// Everything kept for one user, stored as a single document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProfileDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<UserCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_override: Option<AdminOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_limits: Option<UsageLimits>,
    #[serde(default)]
    pub token_usage: Vec<UsageEvent>,
    #[serde(default)]
    pub usage_metrics: UsageMetrics,
    #[serde(skip)]
    request_ids: HashSet<String>,
}

impl ProfileDocument {
    fn is_empty(&self) -> bool {
        self.api_key.is_none()
            && self.admin_override.is_none()
            && self.usage_limits.is_none()
            && self.token_usage.is_empty()
    }
}

/// In-process store. One lock guards every document, so each operation is
/// atomic with respect to all others.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    profiles: Arc<Mutex<BTreeMap<String, ProfileDocument>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the user's whole document, mainly for inspection in tests.
    pub async fn snapshot(&self, user_id: &str) -> Option<ProfileDocument> {
        self.profiles.lock().await.get(user_id).cloned()
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn credential(&self, user_id: &str) -> Result<Option<UserCredential>, StoreError> {
        let profiles = self.profiles.lock().await;
        Ok(profiles.get(user_id).and_then(|doc| doc.api_key.clone()))
    }

    async fn put_credential(
        &self,
        user_id: &str,
        credential: &UserCredential,
    ) -> Result<(), StoreError> {
        let mut profiles = self.profiles.lock().await;
        profiles.entry(user_id.to_string()).or_default().api_key = Some(credential.clone());
        Ok(())
    }

    async fn patch_credential(
        &self,
        user_id: &str,
        patch: &CredentialPatch,
    ) -> Result<bool, StoreError> {
        let mut profiles = self.profiles.lock().await;
        let Some(credential) = profiles
            .get_mut(user_id)
            .and_then(|doc| doc.api_key.as_mut())
        else {
            return Ok(false);
        };
        if let Some(is_valid) = patch.is_valid {
            credential.is_valid = is_valid;
        }
        if let Some(at) = patch.last_validated_at_ms {
            credential.last_validated_at_ms = Some(at);
        }
        if let Some(until) = patch.rate_limited_until_ms {
            credential.rate_limited_until_ms = until;
        }
        Ok(true)
    }

    async fn delete_credential(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut profiles = self.profiles.lock().await;
        let removed = profiles
            .get_mut(user_id)
            .and_then(|doc| doc.api_key.take())
            .is_some();
        if profiles.get(user_id).is_some_and(ProfileDocument::is_empty) {
            profiles.remove(user_id);
        }
        Ok(removed)
    }

    async fn admin_override(&self, user_id: &str) -> Result<Option<AdminOverride>, StoreError> {
        let profiles = self.profiles.lock().await;
        Ok(profiles
            .get(user_id)
            .and_then(|doc| doc.admin_override.clone()))
    }

    async fn put_override(&self, user_id: &str, value: &AdminOverride) -> Result<(), StoreError> {
        let mut profiles = self.profiles.lock().await;
        profiles.entry(user_id.to_string()).or_default().admin_override = Some(value.clone());
        Ok(())
    }

    async fn delete_override(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut profiles = self.profiles.lock().await;
        let removed = profiles
            .get_mut(user_id)
            .and_then(|doc| doc.admin_override.take())
            .is_some();
        if profiles.get(user_id).is_some_and(ProfileDocument::is_empty) {
            profiles.remove(user_id);
        }
        Ok(removed)
    }

    async fn usage_limits(&self, user_id: &str) -> Result<Option<UsageLimits>, StoreError> {
        let profiles = self.profiles.lock().await;
        Ok(profiles.get(user_id).and_then(|doc| doc.usage_limits))
    }

    async fn put_usage_limits(
        &self,
        user_id: &str,
        limits: &UsageLimits,
    ) -> Result<(), StoreError> {
        let mut profiles = self.profiles.lock().await;
        profiles.entry(user_id.to_string()).or_default().usage_limits = Some(*limits);
        Ok(())
    }

    async fn append_usage(
        &self,
        user_id: &str,
        event: &UsageEvent,
    ) -> Result<AppendOutcome, StoreError> {
        let mut profiles = self.profiles.lock().await;
        let doc = profiles.entry(user_id.to_string()).or_default();
        if let Some(request_id) = event.request_id.as_deref() {
            if doc.request_ids.contains(request_id) {
                return Ok(AppendOutcome::Duplicate);
            }
        }
        doc.usage_metrics.apply(event)?;
        if let Some(request_id) = event.request_id.as_deref() {
            doc.request_ids.insert(request_id.to_string());
        }
        doc.token_usage.push(event.clone());
        Ok(AppendOutcome::Recorded)
    }

    async fn usage_events(
        &self,
        user_id: &str,
        range: &DayRange,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        let profiles = self.profiles.lock().await;
        let Some(doc) = profiles.get(user_id) else {
            return Ok(Vec::new());
        };
        let mut events: Vec<UsageEvent> = doc
            .token_usage
            .iter()
            .filter(|event| {
                day_key(event.timestamp_ms).is_ok_and(|day| range.contains(&day))
            })
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp_ms);
        Ok(events)
    }

    async fn usage_metrics(&self, user_id: &str) -> Result<UsageMetrics, StoreError> {
        let profiles = self.profiles.lock().await;
        Ok(profiles
            .get(user_id)
            .map(|doc| doc.usage_metrics.clone())
            .unwrap_or_default())
    }

    async fn user_ids(&self) -> Result<Vec<String>, StoreError> {
        let profiles = self.profiles.lock().await;
        Ok(profiles.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeySource;

    fn credential() -> UserCredential {
        UserCredential {
            encrypted_key: vec![1, 2, 3],
            salt: vec![4, 5, 6],
            key_hash: "ab".repeat(32),
            is_valid: true,
            key_source: KeySource::User,
            added_at_ms: Some(1),
            last_validated_at_ms: None,
            expires_at_ms: None,
            rate_limited_until_ms: None,
        }
    }

    fn event(request_id: Option<&str>) -> UsageEvent {
        UsageEvent {
            model: "gemini-1.5-flash".to_string(),
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
            cost_usd_micros: 1,
            timestamp_ms: 1_711_929_601_000,
            session_id: None,
            request_id: request_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn patch_only_touches_named_fields() {
        let store = MemoryStore::new();
        assert!(
            !store
                .patch_credential("u1", &CredentialPatch::default())
                .await
                .expect("patch")
        );

        store.put_credential("u1", &credential()).await.expect("put");
        let patched = store
            .patch_credential(
                "u1",
                &CredentialPatch {
                    is_valid: Some(false),
                    rate_limited_until_ms: Some(Some(99)),
                    ..CredentialPatch::default()
                },
            )
            .await
            .expect("patch");
        assert!(patched);

        let stored = store.credential("u1").await.expect("get").expect("some");
        assert!(!stored.is_valid);
        assert_eq!(stored.rate_limited_until_ms, Some(99));
        assert_eq!(stored.added_at_ms, Some(1));
        assert_eq!(stored.encrypted_key, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn append_usage_skips_replayed_request_ids() {
        let store = MemoryStore::new();
        assert_eq!(
            store.append_usage("u1", &event(Some("r1"))).await.expect("append"),
            AppendOutcome::Recorded
        );
        assert_eq!(
            store.append_usage("u1", &event(Some("r1"))).await.expect("append"),
            AppendOutcome::Duplicate
        );
        assert_eq!(
            store.append_usage("u1", &event(None)).await.expect("append"),
            AppendOutcome::Recorded
        );
        assert_eq!(
            store.append_usage("u1", &event(None)).await.expect("append"),
            AppendOutcome::Recorded
        );

        let metrics = store.usage_metrics("u1").await.expect("metrics");
        assert_eq!(metrics.totals.all_time_requests, 3);
        assert_eq!(metrics.totals.all_time_tokens, 15);
    }

    #[tokio::test]
    async fn deleting_last_field_drops_the_document() {
        let store = MemoryStore::new();
        store.put_credential("u1", &credential()).await.expect("put");
        assert_eq!(store.user_ids().await.expect("ids"), vec!["u1".to_string()]);
        assert!(store.delete_credential("u1").await.expect("delete"));
        assert!(!store.delete_credential("u1").await.expect("delete"));
        assert!(store.user_ids().await.expect("ids").is_empty());
        assert!(store.snapshot("u1").await.is_none());
    }
}
