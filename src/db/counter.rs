//! Postgres-backed lock counters.
//!
//! Each primitive is a single statement, so Postgres row locking provides
//! the atomicity the lock service relies on. Rows past their `expires_at`
//! count as absent and are overwritten or swept lazily.

use crate::error::Result;
use crate::lock::{CounterStore, LockRecord};
use crate::telemetry::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::time::Duration;

/// Leases longer than this (about 3 000 years) are stored without an expiry,
/// the same way the in-memory store treats an unrepresentable deadline.
const MAX_EXPIRING_TTL_SECS: f64 = 1e11;

fn count(operation: &'static str) {
    metrics::store_operations().add(
        1,
        &[
            KeyValue::new("backend", "postgres"),
            KeyValue::new("operation", operation),
        ],
    );
}

#[async_trait]
impl CounterStore for super::Db {
    async fn increment_and_get(&self, key: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO lock_counters (key, value, expires_at)
             VALUES ($1, 1, NULL)
             ON CONFLICT (key) DO UPDATE SET
                 value = CASE
                     WHEN lock_counters.expires_at IS NOT NULL AND lock_counters.expires_at <= now()
                     THEN 1
                     ELSE lock_counters.value + 1
                 END,
                 expires_at = CASE
                     WHEN lock_counters.expires_at IS NOT NULL AND lock_counters.expires_at <= now()
                     THEN NULL
                     ELSE lock_counters.expires_at
                 END
             RETURNING value",
        )
        .bind(key)
        .fetch_one(self.pool())
        .await?;
        count("increment");
        Ok(row.0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let secs = Some(ttl.as_secs_f64()).filter(|secs| *secs <= MAX_EXPIRING_TTL_SECS);
        // NULL seconds propagate to a NULL expires_at.
        let result = sqlx::query(
            "UPDATE lock_counters
             SET expires_at = now() + make_interval(secs => $2)
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .bind(secs)
        .execute(self.pool())
        .await?;
        count("expire");
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        // Expired rows are removed too, but only a live row counts as released.
        let live: Option<(bool,)> = sqlx::query_as(
            "DELETE FROM lock_counters
             WHERE key = $1
             RETURNING (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await?;
        count("delete");
        Ok(live.is_some_and(|(live,)| live))
    }

    async fn peek(&self, key: &str) -> Result<Option<LockRecord>> {
        let row: Option<(i64, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT value, expires_at FROM lock_counters
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await?;
        count("peek");
        Ok(row.map(|(value, expires_at)| LockRecord {
            key: key.to_string(),
            value,
            expires_at,
        }))
    }
}

impl super::Db {
    /// Delete every expired counter. Returns how many rows were removed.
    pub async fn purge_expired_locks(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM lock_counters WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(self.pool())
        .await?;
        count("purge");
        Ok(result.rows_affected())
    }
}
