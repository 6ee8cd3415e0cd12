//! Usage ledger: appends billable events and answers rollup and limit queries.

pub mod pricing;
pub mod rollup;

use std::sync::Arc;

use thiserror::Error;

use crate::auth::AdminGrant;
use crate::clock::Clock;
use crate::store::{DayRange, ProfileStore, StoreError};
use crate::types::{AppendOutcome, LimitType, UsageEvent, UsageLimits, UsageMetrics, UsageReport};

pub use pricing::{ModelPricing, PricingTable, PricingTableError};
pub use rollup::TimestampOutOfRange;

/// How far a caller-supplied `timestamp_ms` may drift from the server clock.
pub const MAX_REPORT_SKEW_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("invalid usage report: {0}")]
    Validation(String),
    #[error("clock error: {0}")]
    Clock(#[from] TimestampOutOfRange),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UsageError {
    pub fn is_retryable(&self) -> bool {
        match self {
            UsageError::Validation(_) | UsageError::Clock(_) => false,
            UsageError::Store(err) => err.is_retryable(),
        }
    }
}

pub struct UsageAggregator {
    store: Arc<dyn ProfileStore>,
    pricing: Arc<PricingTable>,
    clock: Arc<dyn Clock>,
    default_limits: UsageLimits,
}

impl UsageAggregator {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        pricing: Arc<PricingTable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            pricing,
            clock,
            default_limits: UsageLimits::default(),
        }
    }

    /// Limits applied to users without their own stored limits.
    pub fn with_default_limits(mut self, limits: UsageLimits) -> Self {
        self.default_limits = limits;
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Normalizes a caller report into the event that will be stored.
    ///
    /// Token totals are always the server-side sum; a priced model's cost
    /// always comes from the pricing table. The event is stamped with the
    /// server clock; a caller `timestamp_ms` is only checked against it.
    pub fn build_event(&self, report: UsageReport) -> Result<UsageEvent, UsageError> {
        let now_ms = self.clock.now_ms();
        if let Some(reported) = report.timestamp_ms {
            if reported.abs_diff(now_ms) > MAX_REPORT_SKEW_MS {
                return Err(UsageError::Validation(format!(
                    "timestamp_ms {reported} is more than {}s from server time",
                    MAX_REPORT_SKEW_MS / 1000
                )));
            }
        }
        rollup::day_key(now_ms)?;

        let model = pricing::normalize_model(&report.model);
        if model.is_empty() {
            return Err(UsageError::Validation("model must not be empty".to_string()));
        }

        let Some(total_tokens) = report
            .prompt_tokens
            .checked_add(report.completion_tokens)
        else {
            return Err(UsageError::Validation("token counts overflow".to_string()));
        };
        if let Some(reported) = report.total_tokens {
            if reported != total_tokens {
                return Err(UsageError::Validation(format!(
                    "total_tokens {reported} does not equal prompt_tokens + completion_tokens ({total_tokens})"
                )));
            }
        }

        let cost_usd_micros = match self.pricing.compute_cost(
            &model,
            report.prompt_tokens,
            report.completion_tokens,
        ) {
            Some(cost) => cost,
            None => match report.cost_usd {
                Some(usd) => pricing::usd_to_usd_micros(usd).ok_or_else(|| {
                    UsageError::Validation("cost_usd must be finite and >= 0".to_string())
                })?,
                None => {
                    tracing::warn!(
                        model = %model,
                        pricing_version = self.pricing.version(),
                        "no price for model; recording zero cost"
                    );
                    0
                }
            },
        };

        Ok(UsageEvent {
            model,
            prompt_tokens: report.prompt_tokens,
            completion_tokens: report.completion_tokens,
            total_tokens,
            cost_usd_micros,
            timestamp_ms: now_ms,
            session_id: non_empty(report.session_id),
            request_id: non_empty(report.request_id),
        })
    }

    /// Records one completed provider call.
    ///
    /// A replayed `request_id` is a successful no-op. Store failures are
    /// returned to the caller so the usage write can be retried.
    pub async fn record_usage(
        &self,
        user_id: &str,
        report: UsageReport,
    ) -> Result<AppendOutcome, UsageError> {
        let event = self.build_event(report)?;
        match self.store.append_usage(user_id, &event).await {
            Ok(AppendOutcome::Recorded) => {
                tracing::debug!(
                    user_id,
                    model = %event.model,
                    total_tokens = event.total_tokens,
                    cost_usd_micros = event.cost_usd_micros,
                    request_id = event.request_id.as_deref().unwrap_or(""),
                    "usage recorded"
                );
                Ok(AppendOutcome::Recorded)
            }
            Ok(AppendOutcome::Duplicate) => {
                tracing::info!(
                    user_id,
                    request_id = event.request_id.as_deref().unwrap_or(""),
                    "duplicate usage report ignored"
                );
                Ok(AppendOutcome::Duplicate)
            }
            Err(err) => {
                tracing::error!(
                    user_id,
                    request_id = event.request_id.as_deref().unwrap_or(""),
                    retryable = err.is_retryable(),
                    "failed to record usage: {err}"
                );
                Err(UsageError::Store(err))
            }
        }
    }

    pub async fn usage(
        &self,
        user_id: &str,
        range: &DayRange,
    ) -> Result<Vec<UsageEvent>, UsageError> {
        if let (Some(start), Some(end)) = (range.start.as_deref(), range.end.as_deref()) {
            if start > end {
                return Err(UsageError::Validation(format!(
                    "start date {start} is after end date {end}"
                )));
            }
        }
        Ok(self.store.usage_events(user_id, range).await?)
    }

    /// Rollups with the current-month totals filled for the clock's month.
    pub async fn metrics(&self, user_id: &str) -> Result<UsageMetrics, UsageError> {
        let metrics = self.store.usage_metrics(user_id).await?;
        Ok(metrics.with_current_month(self.clock.now_ms())?)
    }

    pub async fn limits(&self, user_id: &str) -> Result<UsageLimits, UsageError> {
        Ok(self
            .store
            .usage_limits(user_id)
            .await?
            .unwrap_or(self.default_limits))
    }

    pub async fn set_usage_limits(
        &self,
        user_id: &str,
        limits: UsageLimits,
        grant: &AdminGrant,
    ) -> Result<(), UsageError> {
        self.store.put_usage_limits(user_id, &limits).await?;
        tracing::info!(user_id, admin_id = grant.admin_id(), "usage limits updated");
        Ok(())
    }

    /// Whether the user's current UTC day or month has reached the limit.
    /// Users without a configured limit of that type are never over it.
    pub async fn is_over_limit(
        &self,
        user_id: &str,
        limit_type: LimitType,
    ) -> Result<bool, UsageError> {
        let Some(limit) = self.limits(user_id).await?.limit(limit_type) else {
            return Ok(false);
        };

        let now_ms = self.clock.now_ms();
        let metrics = self.store.usage_metrics(user_id).await?;
        let current = match limit_type {
            LimitType::DailyTokens | LimitType::DailyCost => {
                let day = metrics.day(&rollup::day_key(now_ms)?);
                match limit_type {
                    LimitType::DailyTokens => day.map(|d| d.total_tokens),
                    _ => day.map(|d| d.total_cost_usd_micros),
                }
            }
            LimitType::MonthlyTokens | LimitType::MonthlyCost => {
                let month = metrics.month(&rollup::month_key(now_ms)?);
                match limit_type {
                    LimitType::MonthlyTokens => month.map(|m| m.total_tokens),
                    _ => month.map(|m| m.total_cost_usd_micros),
                }
            }
        }
        .unwrap_or(0);

        let over = current >= limit;
        if over {
            tracing::debug!(user_id, ?limit_type, current, limit, "usage limit reached");
        }
        Ok(over)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
