//! Cycle snapshots
//!
//! One opaque JSON document per (trader, cycle), upserted so a re-run of the
//! same cycle number replaces the previous snapshot.

use super::{Db, StorageResult};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

pub struct SnapshotStore {
    db: Db,
}

impl SnapshotStore {
    pub fn new(db: Db) -> StorageResult<Self> {
        let store = Self { db };
        store.init_table()?;
        Ok(store)
    }

    fn init_table(&self) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cycle_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id TEXT NOT NULL,
                cycle_number INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                snapshot_data TEXT NOT NULL,
                UNIQUE(trader_id, cycle_number)
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_trader_cycle
                ON cycle_snapshots(trader_id, cycle_number);",
        )?;
        Ok(())
    }

    pub fn log_snapshot(
        &self,
        trader_id: &str,
        cycle_number: i64,
        snapshot: &serde_json::Value,
    ) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO cycle_snapshots (trader_id, cycle_number, timestamp, snapshot_data)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(trader_id, cycle_number) DO UPDATE SET
                timestamp = excluded.timestamp,
                snapshot_data = excluded.snapshot_data",
            params![
                trader_id,
                cycle_number,
                Utc::now().timestamp_millis(),
                snapshot.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn get_snapshot(
        &self,
        trader_id: &str,
        cycle_number: i64,
    ) -> StorageResult<Option<serde_json::Value>> {
        let conn = self.db.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT snapshot_data FROM cycle_snapshots
                 WHERE trader_id = ?1 AND cycle_number = ?2",
                params![trader_id, cycle_number],
                |row| row.get(0),
            )
            .optional()?;

        Ok(data.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub fn get_latest_snapshots(&self, trader_id: &str, n: usize) -> StorageResult<Vec<serde_json::Value>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT snapshot_data FROM cycle_snapshots
             WHERE trader_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![trader_id, n as i64])?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            if let Ok(value) = serde_json::from_str(&data) {
                snapshots.push(value);
            }
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_memory_db;

    #[test]
    fn test_upsert_by_trader_and_cycle() {
        let store = SnapshotStore::new(in_memory_db()).unwrap();

        store
            .log_snapshot("alpha", 1, &serde_json::json!({"equity": 10000.0}))
            .unwrap();
        store
            .log_snapshot("alpha", 1, &serde_json::json!({"equity": 10100.0}))
            .unwrap();

        let snapshot = store.get_snapshot("alpha", 1).unwrap().unwrap();
        assert_eq!(snapshot["equity"], 10100.0);

        let all = store.get_latest_snapshots("alpha", 10).unwrap();
        assert_eq!(all.len(), 1);
    }
}
