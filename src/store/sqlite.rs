use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use super::{DayRange, ProfileStore, StoreError};
use crate::types::{
    AdminOverride, AppendOutcome, CredentialPatch, DailyUsage, KeySource, ModelUsage,
    MonthlyUsage, UsageEvent, UsageLimits, UsageMetrics, UsageTotals, UserCredential,
};
use crate::usage::rollup::{day_key, month_key};

/// SQLite-backed profile store sharing one connection across requests.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (or creates) the database and applies the schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = open_connection(open_path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))?;
            op(&mut guard)
        })
        .await?
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn credential(&self, user_id: &str) -> Result<Option<UserCredential>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| load_credential(conn, &user_id))
            .await
    }

    async fn put_credential(
        &self,
        user_id: &str,
        credential: &UserCredential,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let credential = credential.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO credentials (
                    user_id, encrypted_key, salt, key_hash, is_valid, key_source,
                    added_at_ms, last_validated_at_ms, expires_at_ms, rate_limited_until_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(user_id) DO UPDATE SET
                    encrypted_key = excluded.encrypted_key,
                    salt = excluded.salt,
                    key_hash = excluded.key_hash,
                    is_valid = excluded.is_valid,
                    key_source = excluded.key_source,
                    added_at_ms = excluded.added_at_ms,
                    last_validated_at_ms = excluded.last_validated_at_ms,
                    expires_at_ms = excluded.expires_at_ms,
                    rate_limited_until_ms = excluded.rate_limited_until_ms",
                rusqlite::params![
                    user_id,
                    credential.encrypted_key,
                    credential.salt,
                    credential.key_hash,
                    credential.is_valid,
                    credential.key_source.as_str(),
                    credential.added_at_ms.map(u64_to_i64),
                    credential.last_validated_at_ms.map(u64_to_i64),
                    credential.expires_at_ms.map(u64_to_i64),
                    credential.rate_limited_until_ms.map(u64_to_i64),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn patch_credential(
        &self,
        user_id: &str,
        patch: &CredentialPatch,
    ) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        let patch = patch.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM credentials WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(false);
            }

            if let Some(is_valid) = patch.is_valid {
                tx.execute(
                    "UPDATE credentials SET is_valid = ?2 WHERE user_id = ?1",
                    rusqlite::params![user_id, is_valid],
                )?;
            }
            if let Some(at) = patch.last_validated_at_ms {
                tx.execute(
                    "UPDATE credentials SET last_validated_at_ms = ?2 WHERE user_id = ?1",
                    rusqlite::params![user_id, u64_to_i64(at)],
                )?;
            }
            if let Some(until) = patch.rate_limited_until_ms {
                tx.execute(
                    "UPDATE credentials SET rate_limited_until_ms = ?2 WHERE user_id = ?1",
                    rusqlite::params![user_id, until.map(u64_to_i64)],
                )?;
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn delete_credential(&self, user_id: &str) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM credentials WHERE user_id = ?1",
                rusqlite::params![user_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn admin_override(&self, user_id: &str) -> Result<Option<AdminOverride>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM overrides WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn put_override(&self, user_id: &str, value: &AdminOverride) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let value_json = serde_json::to_string(value)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO overrides (user_id, value_json) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET value_json = excluded.value_json",
                rusqlite::params![user_id, value_json],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_override(&self, user_id: &str) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM overrides WHERE user_id = ?1",
                rusqlite::params![user_id],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn usage_limits(&self, user_id: &str) -> Result<Option<UsageLimits>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM usage_limits WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn put_usage_limits(
        &self,
        user_id: &str,
        limits: &UsageLimits,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let value_json = serde_json::to_string(limits)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO usage_limits (user_id, value_json) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET value_json = excluded.value_json",
                rusqlite::params![user_id, value_json],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_usage(
        &self,
        user_id: &str,
        event: &UsageEvent,
    ) -> Result<AppendOutcome, StoreError> {
        let user_id = user_id.to_string();
        let event = event.clone();
        self.with_conn(move |conn| {
            let day = day_key(event.timestamp_ms)?;
            let month = month_key(event.timestamp_ms)?;
            let tokens = u64_to_i64(event.total_tokens);
            let cost = u64_to_i64(event.cost_usd_micros);

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO usage_events (
                    user_id, request_id, session_id, model, prompt_tokens,
                    completion_tokens, total_tokens, cost_usd_micros, ts_ms, day
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    user_id,
                    event.request_id,
                    event.session_id,
                    event.model,
                    u64_to_i64(event.prompt_tokens),
                    u64_to_i64(event.completion_tokens),
                    tokens,
                    cost,
                    u64_to_i64(event.timestamp_ms),
                    day,
                ],
            )?;
            if inserted == 0 {
                return Ok(AppendOutcome::Duplicate);
            }

            tx.execute(
                "INSERT INTO usage_daily (user_id, day, total_tokens, total_cost_usd_micros, request_count)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT(user_id, day) DO UPDATE SET
                    total_tokens = total_tokens + excluded.total_tokens,
                    total_cost_usd_micros = total_cost_usd_micros + excluded.total_cost_usd_micros,
                    request_count = request_count + 1",
                rusqlite::params![user_id, day, tokens, cost],
            )?;
            tx.execute(
                "INSERT INTO usage_daily_models (user_id, day, model, total_tokens, total_cost_usd_micros, request_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(user_id, day, model) DO UPDATE SET
                    total_tokens = total_tokens + excluded.total_tokens,
                    total_cost_usd_micros = total_cost_usd_micros + excluded.total_cost_usd_micros,
                    request_count = request_count + 1",
                rusqlite::params![user_id, day, event.model, tokens, cost],
            )?;
            tx.execute(
                "INSERT INTO usage_monthly (user_id, month, total_tokens, total_cost_usd_micros, request_count)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT(user_id, month) DO UPDATE SET
                    total_tokens = total_tokens + excluded.total_tokens,
                    total_cost_usd_micros = total_cost_usd_micros + excluded.total_cost_usd_micros,
                    request_count = request_count + 1",
                rusqlite::params![user_id, month, tokens, cost],
            )?;
            tx.execute(
                "INSERT INTO usage_totals (user_id, total_tokens, total_cost_usd_micros, request_count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(user_id) DO UPDATE SET
                    total_tokens = total_tokens + excluded.total_tokens,
                    total_cost_usd_micros = total_cost_usd_micros + excluded.total_cost_usd_micros,
                    request_count = request_count + 1",
                rusqlite::params![user_id, tokens, cost],
            )?;
            tx.commit()?;
            Ok(AppendOutcome::Recorded)
        })
        .await
    }

    async fn usage_events(
        &self,
        user_id: &str,
        range: &DayRange,
    ) -> Result<Vec<UsageEvent>, StoreError> {
        let user_id = user_id.to_string();
        let range = range.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT model, prompt_tokens, completion_tokens, total_tokens, cost_usd_micros,
                        ts_ms, session_id, request_id
                 FROM usage_events
                 WHERE user_id = ?1
                   AND (?2 IS NULL OR day >= ?2)
                   AND (?3 IS NULL OR day <= ?3)
                 ORDER BY ts_ms, id",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![user_id, range.start, range.end],
                |row| {
                    Ok(UsageEvent {
                        model: row.get(0)?,
                        prompt_tokens: i64_to_u64(row.get(1)?),
                        completion_tokens: i64_to_u64(row.get(2)?),
                        total_tokens: i64_to_u64(row.get(3)?),
                        cost_usd_micros: i64_to_u64(row.get(4)?),
                        timestamp_ms: i64_to_u64(row.get(5)?),
                        session_id: row.get(6)?,
                        request_id: row.get(7)?,
                    })
                },
            )?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
        .await
    }

    async fn usage_metrics(&self, user_id: &str) -> Result<UsageMetrics, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| load_metrics(conn, &user_id))
            .await
    }

    async fn user_ids(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM credentials
                 UNION SELECT user_id FROM overrides
                 UNION SELECT user_id FROM usage_limits
                 UNION SELECT user_id FROM usage_totals
                 ORDER BY 1",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
        .await
    }
}

type CredentialRow = (
    Vec<u8>,
    Vec<u8>,
    String,
    bool,
    String,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<i64>,
);

fn load_credential(conn: &Connection, user_id: &str) -> Result<Option<UserCredential>, StoreError> {
    let row: Option<CredentialRow> = conn
        .query_row(
            "SELECT encrypted_key, salt, key_hash, is_valid, key_source,
                    added_at_ms, last_validated_at_ms, expires_at_ms, rate_limited_until_ms
             FROM credentials WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            },
        )
        .optional()?;

    let Some((
        encrypted_key,
        salt,
        key_hash,
        is_valid,
        key_source,
        added_at_ms,
        last_validated_at_ms,
        expires_at_ms,
        rate_limited_until_ms,
    )) = row
    else {
        return Ok(None);
    };

    let Some(key_source) = KeySource::parse(&key_source) else {
        return Err(StoreError::Corrupt {
            user_id: user_id.to_string(),
            reason: format!("unknown key_source {key_source:?}"),
        });
    };

    Ok(Some(UserCredential {
        encrypted_key,
        salt,
        key_hash,
        is_valid,
        key_source,
        added_at_ms: added_at_ms.map(i64_to_u64),
        last_validated_at_ms: last_validated_at_ms.map(i64_to_u64),
        expires_at_ms: expires_at_ms.map(i64_to_u64),
        rate_limited_until_ms: rate_limited_until_ms.map(i64_to_u64),
    }))
}

fn load_metrics(conn: &Connection, user_id: &str) -> Result<UsageMetrics, StoreError> {
    let mut metrics = UsageMetrics::default();

    let mut stmt = conn.prepare(
        "SELECT day, total_tokens, total_cost_usd_micros, request_count
         FROM usage_daily WHERE user_id = ?1 ORDER BY day",
    )?;
    let rows = stmt.query_map(rusqlite::params![user_id], |row| {
        Ok(DailyUsage {
            date: row.get(0)?,
            total_tokens: i64_to_u64(row.get(1)?),
            total_cost_usd_micros: i64_to_u64(row.get(2)?),
            request_count: i64_to_u64(row.get(3)?),
            model_breakdown: Default::default(),
        })
    })?;
    for row in rows {
        metrics.daily.push(row?);
    }

    let mut stmt = conn.prepare(
        "SELECT day, model, total_tokens, total_cost_usd_micros, request_count
         FROM usage_daily_models WHERE user_id = ?1",
    )?;
    let rows = stmt.query_map(rusqlite::params![user_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            ModelUsage {
                total_tokens: i64_to_u64(row.get(2)?),
                total_cost_usd_micros: i64_to_u64(row.get(3)?),
                request_count: i64_to_u64(row.get(4)?),
            },
        ))
    })?;
    for row in rows {
        let (day, model, usage) = row?;
        if let Ok(index) = metrics
            .daily
            .binary_search_by(|bucket| bucket.date.as_str().cmp(day.as_str()))
        {
            metrics.daily[index].model_breakdown.insert(model, usage);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT month, total_tokens, total_cost_usd_micros, request_count
         FROM usage_monthly WHERE user_id = ?1 ORDER BY month",
    )?;
    let rows = stmt.query_map(rusqlite::params![user_id], |row| {
        Ok(MonthlyUsage {
            month: row.get(0)?,
            total_tokens: i64_to_u64(row.get(1)?),
            total_cost_usd_micros: i64_to_u64(row.get(2)?),
            request_count: i64_to_u64(row.get(3)?),
        })
    })?;
    for row in rows {
        metrics.monthly.push(row?);
    }

    let totals: Option<(i64, i64, i64)> = conn
        .query_row(
            "SELECT total_tokens, total_cost_usd_micros, request_count
             FROM usage_totals WHERE user_id = ?1",
            rusqlite::params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    if let Some((tokens, cost, requests)) = totals {
        metrics.totals = UsageTotals {
            all_time_tokens: i64_to_u64(tokens),
            all_time_cost_usd_micros: i64_to_u64(cost),
            all_time_requests: i64_to_u64(requests),
            ..UsageTotals::default()
        };
    }

    Ok(metrics)
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS credentials (
            user_id TEXT PRIMARY KEY NOT NULL,
            encrypted_key BLOB NOT NULL,
            salt BLOB NOT NULL,
            key_hash TEXT NOT NULL,
            is_valid INTEGER NOT NULL,
            key_source TEXT NOT NULL,
            added_at_ms INTEGER,
            last_validated_at_ms INTEGER,
            expires_at_ms INTEGER,
            rate_limited_until_ms INTEGER
        );

        CREATE TABLE IF NOT EXISTS overrides (
            user_id TEXT PRIMARY KEY NOT NULL,
            value_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_limits (
            user_id TEXT PRIMARY KEY NOT NULL,
            value_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            request_id TEXT,
            session_id TEXT,
            model TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            cost_usd_micros INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL,
            day TEXT NOT NULL,
            UNIQUE(user_id, request_id)
        );
        CREATE INDEX IF NOT EXISTS idx_usage_events_user_day
            ON usage_events(user_id, day);

        CREATE TABLE IF NOT EXISTS usage_daily (
            user_id TEXT NOT NULL,
            day TEXT NOT NULL,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            total_cost_usd_micros INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, day)
        );

        CREATE TABLE IF NOT EXISTS usage_daily_models (
            user_id TEXT NOT NULL,
            day TEXT NOT NULL,
            model TEXT NOT NULL,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            total_cost_usd_micros INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, day, model)
        );

        CREATE TABLE IF NOT EXISTS usage_monthly (
            user_id TEXT NOT NULL,
            month TEXT NOT NULL,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            total_cost_usd_micros INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, month)
        );

        CREATE TABLE IF NOT EXISTS usage_totals (
            user_id TEXT PRIMARY KEY NOT NULL,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            total_cost_usd_micros INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0
        );",
    )
}

fn open_connection(path: PathBuf) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
