//! Folding usage events into daily, monthly and all-time buckets.
//!
//! Buckets are keyed by UTC calendar day (`YYYY-MM-DD`) and month (`YYYY-MM`).

use thiserror::Error;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::types::{DailyUsage, MonthlyUsage, UsageEvent, UsageMetrics};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("timestamp {0} ms is outside the supported calendar range")]
pub struct TimestampOutOfRange(pub u64);

pub fn day_key(timestamp_ms: u64) -> Result<String, TimestampOutOfRange> {
    let date = utc_date(timestamp_ms)?;
    Ok(format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    ))
}

pub fn month_key(timestamp_ms: u64) -> Result<String, TimestampOutOfRange> {
    let date = utc_date(timestamp_ms)?;
    Ok(format!("{:04}-{:02}", date.year(), u8::from(date.month())))
}

/// Parses a `YYYY-MM-DD` query bound into its canonical day key.
pub fn parse_day(raw: &str) -> Option<String> {
    let date = Date::parse(raw.trim(), format_description!("[year]-[month]-[day]")).ok()?;
    Some(format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    ))
}

fn utc_date(timestamp_ms: u64) -> Result<Date, TimestampOutOfRange> {
    let nanos = i128::from(timestamp_ms).saturating_mul(1_000_000);
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map(OffsetDateTime::date)
        .map_err(|_| TimestampOutOfRange(timestamp_ms))
}

impl UsageMetrics {
    /// Adds one event to every bucket it belongs to.
    ///
    /// `totals.all_time_tokens` stays equal to the sum of `daily[].total_tokens`.
    /// An event whose timestamp has no calendar date leaves every bucket untouched.
    pub fn apply(&mut self, event: &UsageEvent) -> Result<(), TimestampOutOfRange> {
        let date = day_key(event.timestamp_ms)?;
        let month = month_key(event.timestamp_ms)?;

        let day_index = match self.daily.binary_search_by(|bucket| bucket.date.cmp(&date)) {
            Ok(index) => index,
            Err(index) => {
                self.daily.insert(
                    index,
                    DailyUsage {
                        date,
                        ..DailyUsage::default()
                    },
                );
                index
            }
        };
        let day = &mut self.daily[day_index];
        day.total_tokens = day.total_tokens.saturating_add(event.total_tokens);
        day.total_cost_usd_micros = day
            .total_cost_usd_micros
            .saturating_add(event.cost_usd_micros);
        day.request_count = day.request_count.saturating_add(1);
        let model = day.model_breakdown.entry(event.model.clone()).or_default();
        model.total_tokens = model.total_tokens.saturating_add(event.total_tokens);
        model.total_cost_usd_micros = model
            .total_cost_usd_micros
            .saturating_add(event.cost_usd_micros);
        model.request_count = model.request_count.saturating_add(1);

        let month_index = match self
            .monthly
            .binary_search_by(|bucket| bucket.month.cmp(&month))
        {
            Ok(index) => index,
            Err(index) => {
                self.monthly.insert(
                    index,
                    MonthlyUsage {
                        month,
                        ..MonthlyUsage::default()
                    },
                );
                index
            }
        };
        let bucket = &mut self.monthly[month_index];
        bucket.total_tokens = bucket.total_tokens.saturating_add(event.total_tokens);
        bucket.total_cost_usd_micros = bucket
            .total_cost_usd_micros
            .saturating_add(event.cost_usd_micros);
        bucket.request_count = bucket.request_count.saturating_add(1);

        let totals = &mut self.totals;
        totals.all_time_tokens = totals.all_time_tokens.saturating_add(event.total_tokens);
        totals.all_time_cost_usd_micros = totals
            .all_time_cost_usd_micros
            .saturating_add(event.cost_usd_micros);
        totals.all_time_requests = totals.all_time_requests.saturating_add(1);
        Ok(())
    }

    /// Fills the `current_month_*` totals for the month containing `now_ms`.
    pub fn with_current_month(mut self, now_ms: u64) -> Result<Self, TimestampOutOfRange> {
        let current = month_key(now_ms)?;
        let (tokens, cost) = self
            .month(&current)
            .map(|bucket| (bucket.total_tokens, bucket.total_cost_usd_micros))
            .unwrap_or((0, 0));
        self.totals.current_month_tokens = tokens;
        self.totals.current_month_cost_usd_micros = cost;
        Ok(self)
    }

    pub fn day(&self, date: &str) -> Option<&DailyUsage> {
        self.daily.iter().find(|bucket| bucket.date == date)
    }

    pub fn month(&self, month: &str) -> Option<&MonthlyUsage> {
        self.monthly.iter().find(|bucket| bucket.month == month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-31T23:59:59Z and 2024-04-01T00:00:01Z
    const LAST_SECOND_OF_MARCH: u64 = 1_711_929_599_000;
    const FIRST_SECOND_OF_APRIL: u64 = 1_711_929_601_000;

    fn event(model: &str, tokens: u64, cost: u64, ts: u64) -> UsageEvent {
        UsageEvent {
            model: model.to_string(),
            prompt_tokens: tokens,
            completion_tokens: 0,
            total_tokens: tokens,
            cost_usd_micros: cost,
            timestamp_ms: ts,
            session_id: None,
            request_id: None,
        }
    }

    #[test]
    fn day_and_month_keys_use_utc_calendar() {
        assert_eq!(day_key(LAST_SECOND_OF_MARCH).unwrap(), "2024-03-31");
        assert_eq!(month_key(LAST_SECOND_OF_MARCH).unwrap(), "2024-03");
        assert_eq!(day_key(FIRST_SECOND_OF_APRIL).unwrap(), "2024-04-01");
        assert_eq!(month_key(FIRST_SECOND_OF_APRIL).unwrap(), "2024-04");
        assert_eq!(day_key(0).unwrap(), "1970-01-01");
    }

    #[test]
    fn unrepresentable_timestamps_are_errors() {
        assert_eq!(day_key(u64::MAX), Err(TimestampOutOfRange(u64::MAX)));
        assert!(month_key(u64::MAX).is_err());

        let mut metrics = UsageMetrics::default();
        metrics
            .apply(&event("m", 5, 1, LAST_SECOND_OF_MARCH))
            .unwrap();
        let before = metrics.clone();
        assert!(metrics.apply(&event("m", 7, 1, u64::MAX)).is_err());
        assert_eq!(metrics, before);
        assert!(metrics.with_current_month(u64::MAX).is_err());
    }

    #[test]
    fn parse_day_accepts_only_calendar_dates() {
        assert_eq!(parse_day("2024-04-01").as_deref(), Some("2024-04-01"));
        assert_eq!(parse_day(" 2024-02-29 ").as_deref(), Some("2024-02-29"));
        assert!(parse_day("2023-02-29").is_none());
        assert!(parse_day("yesterday").is_none());
    }

    #[test]
    fn apply_splits_buckets_across_month_boundary() {
        let mut metrics = UsageMetrics::default();
        metrics.apply(&event("gemini-1.5-flash", 10, 3, LAST_SECOND_OF_MARCH)).unwrap();
        metrics.apply(&event("gemini-1.5-pro", 20, 7, FIRST_SECOND_OF_APRIL)).unwrap();
        metrics.apply(&event("gemini-1.5-flash", 5, 1, FIRST_SECOND_OF_APRIL)).unwrap();

        assert_eq!(metrics.daily.len(), 2);
        assert_eq!(metrics.daily[0].date, "2024-03-31");
        assert_eq!(metrics.daily[1].date, "2024-04-01");
        assert_eq!(metrics.daily[1].total_tokens, 25);
        assert_eq!(metrics.daily[1].request_count, 2);
        assert_eq!(metrics.daily[1].model_breakdown.len(), 2);
        assert_eq!(
            metrics.daily[1].model_breakdown["gemini-1.5-flash"].total_tokens,
            5
        );

        assert_eq!(metrics.monthly.len(), 2);
        assert_eq!(metrics.month("2024-04").map(|m| m.total_cost_usd_micros), Some(8));

        assert_eq!(metrics.totals.all_time_tokens, 35);
        assert_eq!(metrics.totals.all_time_requests, 3);
        let daily_sum: u64 = metrics.daily.iter().map(|d| d.total_tokens).sum();
        assert_eq!(daily_sum, metrics.totals.all_time_tokens);
    }

    #[test]
    fn apply_keeps_buckets_sorted_for_out_of_order_events() {
        let mut metrics = UsageMetrics::default();
        metrics.apply(&event("m", 1, 0, FIRST_SECOND_OF_APRIL)).unwrap();
        metrics.apply(&event("m", 1, 0, LAST_SECOND_OF_MARCH)).unwrap();
        let dates: Vec<&str> = metrics.daily.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["2024-03-31", "2024-04-01"]);
    }

    #[test]
    fn current_month_totals_follow_the_clock() {
        let mut metrics = UsageMetrics::default();
        metrics.apply(&event("m", 10, 2, LAST_SECOND_OF_MARCH)).unwrap();
        let march = metrics
            .clone()
            .with_current_month(LAST_SECOND_OF_MARCH)
            .unwrap();
        assert_eq!(march.totals.current_month_tokens, 10);
        let april = metrics.with_current_month(FIRST_SECOND_OF_APRIL).unwrap();
        assert_eq!(april.totals.current_month_tokens, 0);
        assert_eq!(april.totals.current_month_cost_usd_micros, 0);
    }
}
