//! Position-logic table and its write-through cache
//!
//! Stores per-(symbol, side) entry/exit reasoning, the current stop/take
//! prices and the first-seen timestamp. Each field upserts independently so
//! partial writes never clobber the others. `PositionLogicManager` fronts
//! the store with an in-memory cache; the store stays authoritative.

use super::{Db, StorageResult};
use crate::decision::logic::{EntryLogic, ExitLogic, PositionLogic};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::RwLock;

/// Raw row shape as persisted
#[derive(Debug, Clone, Default)]
pub struct StoredPositionLogic {
    pub entry_logic: Option<EntryLogic>,
    pub exit_logic: Option<ExitLogic>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub first_seen_time: i64,
}

pub struct PositionLogicStore {
    db: Db,
}

impl PositionLogicStore {
    pub fn new(db: Db) -> StorageResult<Self> {
        let store = Self { db };
        store.init_table()?;
        Ok(store)
    }

    fn init_table(&self) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS position_logic (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_logic TEXT,
                exit_logic TEXT,
                stop_loss REAL NOT NULL DEFAULT 0,
                take_profit REAL NOT NULL DEFAULT 0,
                first_seen_time INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0,
                UNIQUE(symbol, side)
            );
            CREATE INDEX IF NOT EXISTS idx_logic_symbol_side ON position_logic(symbol, side);",
        )?;
        Ok(())
    }

    pub fn save_entry_logic(&self, symbol: &str, side: &str, logic: &EntryLogic) -> StorageResult<()> {
        let json = serde_json::to_string(logic)?;
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO position_logic (symbol, side, entry_logic, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, side) DO UPDATE SET
                entry_logic = excluded.entry_logic,
                updated_at = excluded.updated_at",
            params![symbol, side, json, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn save_exit_logic(&self, symbol: &str, side: &str, logic: &ExitLogic) -> StorageResult<()> {
        let json = serde_json::to_string(logic)?;
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO position_logic (symbol, side, exit_logic, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, side) DO UPDATE SET
                exit_logic = excluded.exit_logic,
                updated_at = excluded.updated_at",
            params![symbol, side, json, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn save_stop_loss(&self, symbol: &str, side: &str, stop_loss: f64) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO position_logic (symbol, side, stop_loss, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, side) DO UPDATE SET
                stop_loss = excluded.stop_loss,
                updated_at = excluded.updated_at",
            params![symbol, side, stop_loss, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn save_take_profit(&self, symbol: &str, side: &str, take_profit: f64) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO position_logic (symbol, side, take_profit, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, side) DO UPDATE SET
                take_profit = excluded.take_profit,
                updated_at = excluded.updated_at",
            params![symbol, side, take_profit, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Save both prices at once; a value of 0 means "keep the current one"
    pub fn save_stop_loss_and_take_profit(
        &self,
        symbol: &str,
        side: &str,
        stop_loss: f64,
        take_profit: f64,
    ) -> StorageResult<()> {
        let existing = self.get_logic(symbol, side)?.unwrap_or_default();

        let stop_loss = if stop_loss > 0.0 { stop_loss } else { existing.stop_loss };
        let take_profit = if take_profit > 0.0 { take_profit } else { existing.take_profit };

        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO position_logic (symbol, side, stop_loss, take_profit, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(symbol, side) DO UPDATE SET
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                updated_at = excluded.updated_at",
            params![symbol, side, stop_loss, take_profit, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn save_first_seen_time(&self, symbol: &str, side: &str, first_seen_ms: i64) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO position_logic (symbol, side, first_seen_time, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol, side) DO UPDATE SET
                first_seen_time = excluded.first_seen_time,
                updated_at = excluded.updated_at",
            params![symbol, side, first_seen_ms, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn get_logic(&self, symbol: &str, side: &str) -> StorageResult<Option<StoredPositionLogic>> {
        let conn = self.db.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT entry_logic, exit_logic, stop_loss, take_profit, first_seen_time
                 FROM position_logic WHERE symbol = ?1 AND side = ?2",
                params![symbol, side],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((entry_json, exit_json, stop_loss, take_profit, first_seen_time)) = row else {
            return Ok(None);
        };

        let entry_logic = match entry_json {
            Some(json) => serde_json::from_str(&json).ok(),
            None => None,
        };
        let exit_logic = match exit_json {
            Some(json) => serde_json::from_str(&json).ok(),
            None => None,
        };

        Ok(Some(StoredPositionLogic {
            entry_logic,
            exit_logic,
            stop_loss,
            take_profit,
            first_seen_time,
        }))
    }

    pub fn get_first_seen_time(&self, symbol: &str, side: &str) -> StorageResult<Option<i64>> {
        Ok(self
            .get_logic(symbol, side)?
            .map(|l| l.first_seen_time)
            .filter(|&t| t > 0))
    }

    /// All persisted first-seen timestamps, keyed `symbol_side` (crash recovery)
    pub fn get_all_first_seen_times(&self) -> StorageResult<HashMap<String, i64>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT symbol, side, first_seen_time FROM position_logic WHERE first_seen_time > 0",
        )?;
        let mut rows = stmt.query([])?;

        let mut result = HashMap::new();
        while let Some(row) = rows.next()? {
            let symbol: String = row.get(0)?;
            let side: String = row.get(1)?;
            let first_seen: i64 = row.get(2)?;
            result.insert(format!("{}_{}", symbol, side), first_seen);
        }
        Ok(result)
    }

    pub fn delete_logic(&self, symbol: &str, side: &str) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "DELETE FROM position_logic WHERE symbol = ?1 AND side = ?2",
            params![symbol, side],
        )?;
        Ok(())
    }
}

/// Write-through cache over `PositionLogicStore`, keyed `symbol_side`.
///
/// `get_logic` always hits the store so the latest persisted stop/take wins,
/// then refreshes the cache; the cache is only a fallback when the store
/// itself errors.
pub struct PositionLogicManager {
    store: std::sync::Arc<PositionLogicStore>,
    cache: RwLock<HashMap<String, PositionLogic>>,
}

fn position_key(symbol: &str, side: &str) -> String {
    format!("{}_{}", symbol, side)
}

impl PositionLogicManager {
    pub fn new(store: std::sync::Arc<PositionLogicStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn save_entry_logic(&self, symbol: &str, side: &str, logic: &EntryLogic) -> StorageResult<()> {
        self.store.save_entry_logic(symbol, side, logic)?;

        let mut cache = self.cache.write().unwrap();
        cache
            .entry(position_key(symbol, side))
            .or_default()
            .entry_logic = Some(logic.clone());
        Ok(())
    }

    pub fn save_exit_logic(&self, symbol: &str, side: &str, logic: &ExitLogic) -> StorageResult<()> {
        self.store.save_exit_logic(symbol, side, logic)?;

        let mut cache = self.cache.write().unwrap();
        cache
            .entry(position_key(symbol, side))
            .or_default()
            .exit_logic = Some(logic.clone());
        Ok(())
    }

    pub fn save_stop_loss(&self, symbol: &str, side: &str, stop_loss: f64) -> StorageResult<()> {
        self.store.save_stop_loss(symbol, side, stop_loss)?;

        let mut cache = self.cache.write().unwrap();
        cache.entry(position_key(symbol, side)).or_default().stop_loss = stop_loss;
        Ok(())
    }

    pub fn save_take_profit(&self, symbol: &str, side: &str, take_profit: f64) -> StorageResult<()> {
        self.store.save_take_profit(symbol, side, take_profit)?;

        let mut cache = self.cache.write().unwrap();
        cache
            .entry(position_key(symbol, side))
            .or_default()
            .take_profit = take_profit;
        Ok(())
    }

    /// Partial price update (0 preserves). Re-reads the row afterwards so
    /// the cache carries whatever actually landed in the store.
    pub fn save_stop_loss_and_take_profit(
        &self,
        symbol: &str,
        side: &str,
        stop_loss: f64,
        take_profit: f64,
    ) -> StorageResult<()> {
        self.store
            .save_stop_loss_and_take_profit(symbol, side, stop_loss, take_profit)?;

        if let Ok(Some(stored)) = self.store.get_logic(symbol, side) {
            let mut cache = self.cache.write().unwrap();
            let entry = cache.entry(position_key(symbol, side)).or_default();
            entry.stop_loss = stored.stop_loss;
            entry.take_profit = stored.take_profit;
            if stored.entry_logic.is_some() {
                entry.entry_logic = stored.entry_logic;
            }
            if stored.exit_logic.is_some() {
                entry.exit_logic = stored.exit_logic;
            }
        }
        Ok(())
    }

    /// Load the logic for a position, store first, cache as fallback
    pub fn get_logic(&self, symbol: &str, side: &str) -> Option<PositionLogic> {
        let key = position_key(symbol, side);

        match self.store.get_logic(symbol, side) {
            Ok(Some(stored)) => {
                let logic = PositionLogic {
                    entry_logic: stored.entry_logic,
                    exit_logic: stored.exit_logic,
                    stop_loss: stored.stop_loss,
                    take_profit: stored.take_profit,
                };
                self.cache.write().unwrap().insert(key, logic.clone());
                Some(logic)
            }
            Ok(None) => self.cache.read().unwrap().get(&key).cloned(),
            Err(_) => self.cache.read().unwrap().get(&key).cloned(),
        }
    }

    pub fn delete_logic(&self, symbol: &str, side: &str) -> StorageResult<()> {
        self.store.delete_logic(symbol, side)?;
        self.cache.write().unwrap().remove(&position_key(symbol, side));
        Ok(())
    }

    pub fn save_first_seen_time(&self, symbol: &str, side: &str, first_seen_ms: i64) -> StorageResult<()> {
        self.store.save_first_seen_time(symbol, side, first_seen_ms)
    }

    pub fn get_first_seen_time(&self, symbol: &str, side: &str) -> Option<i64> {
        self.store.get_first_seen_time(symbol, side).ok().flatten()
    }

    pub fn get_all_first_seen_times(&self) -> StorageResult<HashMap<String, i64>> {
        self.store.get_all_first_seen_times()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_memory_db;
    use std::sync::Arc;

    fn manager() -> PositionLogicManager {
        PositionLogicManager::new(Arc::new(PositionLogicStore::new(in_memory_db()).unwrap()))
    }

    fn entry(reason: &str) -> EntryLogic {
        EntryLogic {
            reasoning: reason.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_partial_price_update_preserves_other_side() {
        let mgr = manager();
        mgr.save_stop_loss_and_take_profit("BTCUSDT", "long", 58_000.0, 62_000.0)
            .unwrap();

        // 0 stop preserves the stored value
        mgr.save_stop_loss_and_take_profit("BTCUSDT", "long", 0.0, 63_000.0)
            .unwrap();

        let logic = mgr.get_logic("BTCUSDT", "long").unwrap();
        assert_eq!(logic.stop_loss, 58_000.0);
        assert_eq!(logic.take_profit, 63_000.0);
    }

    #[test]
    fn test_entry_and_exit_logic_independent() {
        let mgr = manager();
        mgr.save_entry_logic("ETHUSDT", "short", &entry("bearish divergence"))
            .unwrap();
        mgr.save_stop_loss("ETHUSDT", "short", 2_100.0).unwrap();

        let logic = mgr.get_logic("ETHUSDT", "short").unwrap();
        assert_eq!(logic.entry_logic.unwrap().reasoning, "bearish divergence");
        assert!(logic.exit_logic.is_none());
        assert_eq!(logic.stop_loss, 2_100.0);
    }

    #[test]
    fn test_delete_clears_store_and_cache() {
        let mgr = manager();
        mgr.save_stop_loss("BTCUSDT", "long", 58_000.0).unwrap();
        assert!(mgr.get_logic("BTCUSDT", "long").is_some());

        mgr.delete_logic("BTCUSDT", "long").unwrap();
        assert!(mgr.get_logic("BTCUSDT", "long").is_none());
    }

    #[test]
    fn test_first_seen_roundtrip() {
        let mgr = manager();
        assert!(mgr.get_first_seen_time("BTCUSDT", "long").is_none());

        mgr.save_first_seen_time("BTCUSDT", "long", 1_700_000_000_123)
            .unwrap();
        assert_eq!(mgr.get_first_seen_time("BTCUSDT", "long"), Some(1_700_000_000_123));

        let all = mgr.get_all_first_seen_times().unwrap();
        assert_eq!(all.get("BTCUSDT_long"), Some(&1_700_000_000_123));
    }

    #[test]
    fn test_sides_are_distinct_rows() {
        let mgr = manager();
        mgr.save_stop_loss("BTCUSDT", "long", 58_000.0).unwrap();
        mgr.save_stop_loss("BTCUSDT", "short", 64_000.0).unwrap();

        assert_eq!(mgr.get_logic("BTCUSDT", "long").unwrap().stop_loss, 58_000.0);
        assert_eq!(mgr.get_logic("BTCUSDT", "short").unwrap().stop_loss, 64_000.0);
    }
}
