//! SQLite-backed datastore.
//!
//! Leases are stored as absolute expiry timestamps (unix millis) and
//! filtered on read. Watches poll the prefix and diff successive snapshots.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{KeyValue, KvStore, WatchEvent, WatchStream};
use crate::error::KvError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SqliteKv {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqliteKv {
    pub async fn open(path: &Path) -> Result<Self, KvError> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// How often watchers re-read their prefix.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn migrate(&self) -> Result<(), KvError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis() + ttl.as_millis() as i64)
}

async fn list_prefix(pool: &SqlitePool, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
    let rows = sqlx::query(
        r#"
        SELECT key, value FROM kv
        WHERE substr(key, 1, length(?)) = ?
          AND (expires_at IS NULL OR expires_at > ?)
        ORDER BY key
        "#,
    )
    .bind(prefix)
    .bind(prefix)
    .bind(now_millis())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(KeyValue {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
            })
        })
        .collect()
}

/// Events that turn snapshot `old` into snapshot `new`.
fn diff(old: &HashMap<String, Vec<u8>>, new: &HashMap<String, Vec<u8>>) -> Vec<WatchEvent> {
    let mut events: Vec<WatchEvent> = new
        .iter()
        .filter(|(key, value)| old.get(*key) != Some(*value))
        .map(|(key, value)| WatchEvent::Put {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    events.extend(
        old.keys()
            .filter(|key| !new.contains_key(*key))
            .map(|key| WatchEvent::Delete { key: key.clone() }),
    );
    events
}

async fn snapshot(pool: &SqlitePool, prefix: &str) -> Result<HashMap<String, Vec<u8>>, KvError> {
    Ok(list_prefix(pool, prefix)
        .await?
        .into_iter()
        .map(|kv| (kv.key, kv.value))
        .collect())
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let row = sqlx::query(
            "SELECT value FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM kv WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?")
            .bind(key)
            .bind(now_millis())
            .execute(&mut *tx)
            .await?;

        let result =
            sqlx::query("INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?, ?, ?)")
                .bind(key)
                .bind(value)
                .bind(expiry(ttl))
                .execute(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, KvError> {
        list_prefix(&self.pool, prefix).await
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, KvError> {
        let pool = self.pool.clone();
        let prefix = prefix.to_string();
        let poll_interval = self.poll_interval;
        let mut last = snapshot(&pool, &prefix).await?;
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    debug!(prefix = %prefix, "watcher dropped");
                    return;
                }
                let next = match snapshot(&pool, &prefix).await {
                    Ok(next) => next,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                for event in diff(&last, &next) {
                    if tx.send(Ok(event)).await.is_err() {
                        debug!(prefix = %prefix, "watcher dropped");
                        return;
                    }
                }
                last = next;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
