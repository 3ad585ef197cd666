//! SQLite persistence layer
//!
//! Five logically independent tables live in five physical database files
//! under the data directory, one writer connection each:
//!
//! - `trade_history.db`  — completed and in-flight trade rows
//! - `position_logic.db` — per-(symbol, side) entry/exit reasoning and prices
//! - `decision_logs.db`  — append-only per-cycle decision records
//! - `cycle_snapshots.db`— opaque JSON snapshot per (trader, cycle)
//! - `cache.db`          — TTL key/value cache
//!
//! Keeping each table in its own file avoids writer contention between
//! tables; reads within a table go through the same connection.

mod cache;
mod decisions;
mod position_logic;
mod snapshots;
mod trades;

pub use cache::CacheStore;
pub use decisions::{DecisionStore, StoredDecisionRecord};
pub use position_logic::{PositionLogicManager, PositionLogicStore, StoredPositionLogic};
pub use snapshots::SnapshotStore;
pub use trades::{TradeClose, TradeRecord, TradeStore, TradeUpdate};

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Errors produced by the storage layer
#[derive(Debug)]
pub enum StorageError {
    /// The targeted row does not exist (or is already finalized)
    NotFound,
    /// An invariant was violated before touching the database
    Invalid(String),
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "row not found"),
            StorageError::Invalid(msg) => write!(f, "invalid operation: {}", msg),
            StorageError::Sqlite(e) => write!(f, "sqlite error: {}", e),
            StorageError::Serde(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Shared single-writer connection handle
pub(crate) type Db = Arc<Mutex<Connection>>;

/// Open (or create) one database file with the standard pragmas
pub(crate) fn open_database(data_dir: &str, name: &str) -> StorageResult<Db> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| StorageError::Invalid(format!("cannot create data dir {}: {}", data_dir, e)))?;

    let path = Path::new(data_dir).join(format!("{}.db", name));
    let conn = Connection::open(&path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(10_000))?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// Aggregates the five stores behind one construction point
pub struct StorageHub {
    trades: Arc<TradeStore>,
    position_logic: Arc<PositionLogicStore>,
    decisions: Arc<DecisionStore>,
    snapshots: Arc<SnapshotStore>,
    cache: Arc<CacheStore>,
}

impl StorageHub {
    pub fn new(data_dir: &str) -> StorageResult<Self> {
        Ok(Self {
            trades: Arc::new(TradeStore::new(open_database(data_dir, "trade_history")?)?),
            position_logic: Arc::new(PositionLogicStore::new(open_database(
                data_dir,
                "position_logic",
            )?)?),
            decisions: Arc::new(DecisionStore::new(open_database(data_dir, "decision_logs")?)?),
            snapshots: Arc::new(SnapshotStore::new(open_database(
                data_dir,
                "cycle_snapshots",
            )?)?),
            cache: Arc::new(CacheStore::new(open_database(data_dir, "cache")?)?),
        })
    }

    pub fn trades(&self) -> Arc<TradeStore> {
        Arc::clone(&self.trades)
    }

    pub fn position_logic(&self) -> Arc<PositionLogicStore> {
        Arc::clone(&self.position_logic)
    }

    pub fn decisions(&self) -> Arc<DecisionStore> {
        Arc::clone(&self.decisions)
    }

    pub fn snapshots(&self) -> Arc<SnapshotStore> {
        Arc::clone(&self.snapshots)
    }

    pub fn cache(&self) -> Arc<CacheStore> {
        Arc::clone(&self.cache)
    }
}

#[cfg(test)]
pub(crate) fn in_memory_db() -> Db {
    Arc::new(Mutex::new(Connection::open_in_memory().unwrap()))
}
