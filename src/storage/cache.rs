//! Durable TTL cache
//!
//! Arbitrary JSON values keyed by string with an expiry instant. Reads do a
//! lazy expiry check; a background sweeper removes expired rows once a
//! minute so the table never grows unbounded.

use super::{Db, StorageResult};
use crate::logger::{self, LogTag};
use crate::shutdown;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;

pub struct CacheStore {
    db: Db,
}

impl CacheStore {
    pub fn new(db: Db) -> StorageResult<Self> {
        let store = Self { db };
        store.init_table()?;
        Ok(store)
    }

    fn init_table(&self) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache (
                cache_key TEXT PRIMARY KEY,
                cache_data TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_expires_at ON cache(expires_at);",
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let row: Option<(String, i64)> = {
            let conn = self.db.lock().unwrap();
            conn.query_row(
                "SELECT cache_data, expires_at FROM cache WHERE cache_key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .ok()
            .flatten()
        };

        let (data, expires_at) = row?;
        if Utc::now().timestamp_millis() > expires_at {
            let _ = self.delete(key);
            return None;
        }

        serde_json::from_str(&data).ok()
    }

    pub fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> StorageResult<()> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO cache (cache_key, cache_data, timestamp, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
                cache_data = excluded.cache_data,
                timestamp = excluded.timestamp,
                expires_at = excluded.expires_at",
            params![key, value.to_string(), now, expires_at],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute("DELETE FROM cache WHERE cache_key = ?1", params![key])?;
        Ok(())
    }

    /// Remove all expired rows, returning how many were deleted
    pub fn cleanup_expired(&self) -> StorageResult<usize> {
        let conn = self.db.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM cache WHERE expires_at < ?1",
            params![Utc::now().timestamp_millis()],
        )?;
        Ok(deleted)
    }

    /// Spawn the background eviction sweeper (runs every minute)
    pub fn spawn_sweeper(store: Arc<CacheStore>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                if shutdown::is_shutdown_requested() {
                    break;
                }
                match store.cleanup_expired() {
                    Ok(deleted) if deleted > 0 => {
                        logger::debug(
                            LogTag::Storage,
                            &format!("cache sweeper removed {} expired rows", deleted),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        logger::warning(LogTag::Storage, &format!("cache sweeper failed: {}", e));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_memory_db;

    #[test]
    fn test_set_get_roundtrip() {
        let store = CacheStore::new(in_memory_db()).unwrap();
        store
            .set(
                "market:BTCUSDT:3m",
                &serde_json::json!({"price": 60000.0}),
                Duration::from_secs(60),
            )
            .unwrap();

        let value = store.get("market:BTCUSDT:3m").unwrap();
        assert_eq!(value["price"], 60000.0);
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let store = CacheStore::new(in_memory_db()).unwrap();
        store
            .set("stale", &serde_json::json!(1), Duration::from_millis(0))
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get("stale").is_none());
    }

    #[test]
    fn test_cleanup_expired_counts() {
        let store = CacheStore::new(in_memory_db()).unwrap();
        store
            .set("a", &serde_json::json!(1), Duration::from_millis(0))
            .unwrap();
        store
            .set("b", &serde_json::json!(2), Duration::from_secs(120))
            .unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let deleted = store.cleanup_expired().unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("b").is_some());
    }
}
