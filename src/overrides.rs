use std::sync::Arc;

use thiserror::Error;

use crate::auth::AdminGrant;
use crate::clock::Clock;
use crate::store::{ProfileStore, StoreError};
use crate::types::{AdminOverride, OverrideConfig, TriggerCondition};

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("override is missing a valid `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OverrideError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OverrideError::Store(err) if err.is_retryable())
    }
}

/// Admin overrides, one per user. Callers prove the admin check by passing
/// an [`AdminGrant`]; the registry does not re-check roles.
pub struct OverrideRegistry {
    store: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
}

impl OverrideRegistry {
    pub fn new(store: Arc<dyn ProfileStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn set_override(
        &self,
        target_user_id: &str,
        config: OverrideConfig,
        grant: &AdminGrant,
    ) -> Result<AdminOverride, OverrideError> {
        if target_user_id.trim().is_empty() {
            return Err(OverrideError::MissingField("target_user_id"));
        }
        let activated_by = grant.admin_id().trim();
        if activated_by.is_empty() {
            return Err(OverrideError::MissingField("activated_by"));
        }
        if config.is_active && !config.conditions.any() {
            return Err(OverrideError::MissingField("conditions"));
        }
        let now_ms = self.clock.now_ms();
        if config.expires_at_ms.is_some_and(|expires| expires <= now_ms) {
            return Err(OverrideError::MissingField("expires_at_ms"));
        }

        let value = AdminOverride {
            is_active: config.is_active,
            reason: config
                .reason
                .map(|reason| reason.trim().to_string())
                .filter(|reason| !reason.is_empty()),
            activated_by: activated_by.to_string(),
            activated_at_ms: now_ms,
            expires_at_ms: config.expires_at_ms,
            conditions: config.conditions,
            notify_user: config.notify_user,
        };
        self.store.put_override(target_user_id, &value).await?;

        tracing::info!(
            user_id = target_user_id,
            admin_id = activated_by,
            is_active = value.is_active,
            on_missing_key = value.conditions.on_missing_key,
            on_rate_limit_exceeded = value.conditions.on_rate_limit_exceeded,
            on_key_expired = value.conditions.on_key_expired,
            "admin override set"
        );
        Ok(value)
    }

    pub async fn remove_override(
        &self,
        target_user_id: &str,
        grant: &AdminGrant,
    ) -> Result<bool, OverrideError> {
        let removed = self.store.delete_override(target_user_id).await?;
        if removed {
            tracing::info!(
                user_id = target_user_id,
                admin_id = grant.admin_id(),
                "admin override removed"
            );
        }
        Ok(removed)
    }

    pub async fn get_override(&self, user_id: &str) -> Result<Option<AdminOverride>, OverrideError> {
        Ok(self.store.admin_override(user_id).await?)
    }

    /// The user's override if it is in effect for `condition` right now.
    pub async fn active_override(
        &self,
        user_id: &str,
        condition: TriggerCondition,
    ) -> Result<Option<AdminOverride>, OverrideError> {
        let now_ms = self.clock.now_ms();
        Ok(self
            .store
            .admin_override(user_id)
            .await?
            .filter(|value| value.applies_to(condition, now_ms)))
    }

    pub async fn resolve_override(
        &self,
        user_id: &str,
        condition: TriggerCondition,
    ) -> Result<bool, OverrideError> {
        Ok(self.active_override(user_id, condition).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::types::OverrideConditions;

    fn registry() -> (OverrideRegistry, ManualClock) {
        let clock = ManualClock::new(10_000);
        let registry = OverrideRegistry::new(Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
        (registry, clock)
    }

    fn on_missing_key() -> OverrideConfig {
        OverrideConfig {
            is_active: true,
            conditions: OverrideConditions {
                on_missing_key: true,
                ..OverrideConditions::default()
            },
            ..OverrideConfig::default()
        }
    }

    #[tokio::test]
    async fn rejects_misconfigured_overrides() {
        let (registry, _) = registry();
        let grant = AdminGrant::for_tests("admin-1");

        let no_conditions = OverrideConfig {
            is_active: true,
            ..OverrideConfig::default()
        };
        assert!(matches!(
            registry.set_override("u1", no_conditions, &grant).await,
            Err(OverrideError::MissingField("conditions"))
        ));

        let expired = OverrideConfig {
            expires_at_ms: Some(10_000),
            ..on_missing_key()
        };
        assert!(matches!(
            registry.set_override("u1", expired, &grant).await,
            Err(OverrideError::MissingField("expires_at_ms"))
        ));

        assert!(matches!(
            registry
                .set_override("u1", on_missing_key(), &AdminGrant::for_tests(" "))
                .await,
            Err(OverrideError::MissingField("activated_by"))
        ));
    }

    #[tokio::test]
    async fn expiry_deactivates_regardless_of_flag() {
        let (registry, clock) = registry();
        let grant = AdminGrant::for_tests("admin-1");
        let stored = registry
            .set_override(
                "u1",
                OverrideConfig {
                    expires_at_ms: Some(20_000),
                    ..on_missing_key()
                },
                &grant,
            )
            .await
            .expect("set");
        assert_eq!(stored.activated_by, "admin-1");
        assert_eq!(stored.activated_at_ms, 10_000);

        assert!(registry
            .resolve_override("u1", TriggerCondition::MissingKey)
            .await
            .expect("resolve"));
        assert!(!registry
            .resolve_override("u1", TriggerCondition::KeyExpired)
            .await
            .expect("resolve"));

        clock.set(20_000);
        assert!(!registry
            .resolve_override("u1", TriggerCondition::MissingKey)
            .await
            .expect("resolve"));
        assert!(registry.get_override("u1").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn inactive_override_may_omit_conditions() {
        let (registry, _) = registry();
        let grant = AdminGrant::for_tests("admin-1");
        registry
            .set_override("u1", OverrideConfig::default(), &grant)
            .await
            .expect("set");
        assert!(!registry
            .resolve_override("u1", TriggerCondition::MissingKey)
            .await
            .expect("resolve"));
        assert!(registry.remove_override("u1", &grant).await.expect("remove"));
        assert!(!registry.remove_override("u1", &grant).await.expect("remove"));
    }
}
