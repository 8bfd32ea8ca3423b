//! Counting store
//!
//! A keyed integer store with per-key expiry, used for fixed-window rate
//! limit counters and short-TTL boolean caches. All mutations are atomic
//! single operations; callers never read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailgate_common::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::db::DatabasePool;

/// Atomic counting-store collaborator
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment a counter and return the post-increment value.
    /// A key whose expiry has passed is reset to 1.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Attach an expiry to a key. The key is treated as absent once the
    /// expiry passes.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Current value for a key; `None` for absent or expired keys.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Set a key to a value with an expiry.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()>;

    /// Delete expired keys. Returns the number deleted.
    async fn purge_expired(&self) -> Result<u64>;
}

fn ttl_deadline(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

/// Postgres-backed counting store
///
/// Counters live in the `counters` table alongside the queue so a single
/// database serves both; the increment statement resets rows whose expiry
/// has passed, giving fixed-window semantics without a separate reaper.
#[derive(Clone)]
pub struct PgCounterStore {
    db: DatabasePool,
}

impl PgCounterStore {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let (value,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO counters (key, value, expires_at)
            VALUES ($1, 1, NULL)
            ON CONFLICT (key) DO UPDATE SET
                value = CASE
                    WHEN counters.expires_at IS NOT NULL AND counters.expires_at <= NOW()
                    THEN 1
                    ELSE counters.value + 1
                END,
                expires_at = CASE
                    WHEN counters.expires_at IS NOT NULL AND counters.expires_at <= NOW()
                    THEN NULL
                    ELSE counters.expires_at
                END
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| Error::StoreUnavailable(format!("increment failed: {}", e)))?;

        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        sqlx::query("UPDATE counters SET expires_at = $2 WHERE key = $1")
            .bind(key)
            .bind(ttl_deadline(ttl))
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::StoreUnavailable(format!("expire failed: {}", e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT value FROM counters
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::StoreUnavailable(format!("get failed: {}", e)))?;

        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO counters (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = $2, expires_at = $3
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_deadline(ttl))
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::StoreUnavailable(format!("set failed: {}", e)))?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM counters WHERE expires_at IS NOT NULL AND expires_at <= NOW()")
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::StoreUnavailable(format!("purge failed: {}", e)))?;
        Ok(result.rows_affected())
    }
}

struct MemoryEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-memory counting store with the same semantics as [`PgCounterStore`]
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();

        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if e.expired(now) {
                    e.value = 1;
                    e.expires_at = None;
                } else {
                    e.value += 1;
                }
            })
            .or_insert(MemoryEntry {
                value: 1,
                expires_at: None,
            });

        Ok(entry.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| !e.expired(now))
            .map(|e| e.value))
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| !e.expired(now));
        Ok((before - entries.len()) as u64)
    }
}
