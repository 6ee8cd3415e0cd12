//! Persistence of per-user profile documents.
//!
//! The profile document holds the user's encrypted credential, an optional
//! admin override, optional usage limits, the append-only usage events and
//! the rollups derived from them. Implementations must make
//! [`ProfileStore::append_usage`] atomic per user: the event insert, the
//! replay check and every rollup increment succeed or fail together.

mod memory;
#[cfg(feature = "store-sqlite")]
mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    AdminOverride, AppendOutcome, CredentialPatch, UsageEvent, UsageLimits, UsageMetrics,
    UserCredential,
};
use crate::usage::rollup::TimestampOutOfRange;

pub use memory::{MemoryStore, ProfileDocument};
#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt record for user {user_id}: {reason}")]
    Corrupt { user_id: String, reason: String },
    #[error(transparent)]
    Timestamp(#[from] TimestampOutOfRange),
}

impl StoreError {
    /// Transient failures the caller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Join(_) => true,
            #[cfg(feature = "store-sqlite")]
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DiskFull
            ),
            #[cfg(feature = "store-sqlite")]
            StoreError::Sqlite(_) => false,
            StoreError::Json(_) | StoreError::Corrupt { .. } | StoreError::Timestamp(_) => false,
        }
    }
}

/// Inclusive range of UTC day keys (`YYYY-MM-DD`); open ends are unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DayRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl DayRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, day: &str) -> bool {
        if self.start.as_deref().is_some_and(|start| day < start) {
            return false;
        }
        if self.end.as_deref().is_some_and(|end| day > end) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn credential(&self, user_id: &str) -> Result<Option<UserCredential>, StoreError>;

    /// Replaces any existing credential for the user.
    async fn put_credential(
        &self,
        user_id: &str,
        credential: &UserCredential,
    ) -> Result<(), StoreError>;

    /// Returns `false` when the user has no credential to patch.
    async fn patch_credential(
        &self,
        user_id: &str,
        patch: &CredentialPatch,
    ) -> Result<bool, StoreError>;

    async fn delete_credential(&self, user_id: &str) -> Result<bool, StoreError>;

    async fn admin_override(&self, user_id: &str) -> Result<Option<AdminOverride>, StoreError>;

    async fn put_override(&self, user_id: &str, value: &AdminOverride) -> Result<(), StoreError>;

    async fn delete_override(&self, user_id: &str) -> Result<bool, StoreError>;

    async fn usage_limits(&self, user_id: &str) -> Result<Option<UsageLimits>, StoreError>;

    async fn put_usage_limits(
        &self,
        user_id: &str,
        limits: &UsageLimits,
    ) -> Result<(), StoreError>;

    /// Appends the event and folds it into the rollups in one atomic step.
    ///
    /// An event whose `request_id` was already recorded for this user is
    /// ignored and reported as [`AppendOutcome::Duplicate`].
    async fn append_usage(
        &self,
        user_id: &str,
        event: &UsageEvent,
    ) -> Result<AppendOutcome, StoreError>;

    /// Events whose UTC day falls inside `range`, oldest first.
    async fn usage_events(
        &self,
        user_id: &str,
        range: &DayRange,
    ) -> Result<Vec<UsageEvent>, StoreError>;

    /// Stored rollups; `current_month_*` totals are left for the caller to fill.
    async fn usage_metrics(&self, user_id: &str) -> Result<UsageMetrics, StoreError>;

    /// Every user with at least one stored record, sorted.
    async fn user_ids(&self) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_range_is_inclusive() {
        let range = DayRange {
            start: Some("2024-04-01".to_string()),
            end: Some("2024-04-03".to_string()),
        };
        assert!(!range.contains("2024-03-31"));
        assert!(range.contains("2024-04-01"));
        assert!(range.contains("2024-04-03"));
        assert!(!range.contains("2024-04-04"));
        assert!(DayRange::all().contains("1970-01-01"));
    }
}
