//! Trade history table
//!
//! One row covers an entire open → update → close lifecycle. A row is
//! created when a position opens and is updated in place afterwards;
//! `close_time` being set marks the row as final. Timestamps are stored as
//! Unix milliseconds so windowed lookups stay exact.

use super::{Db, StorageError, StorageResult};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Row};

/// One durable trade row (open side + optional close side)
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub side: String,

    // Open side
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub open_time: DateTime<Utc>,
    pub open_price: f64,
    pub open_quantity: f64,
    pub open_leverage: u32,
    pub open_order_id: i64,
    pub open_reason: String,
    pub open_cycle_num: i64,
    pub position_value: f64,
    pub margin_used: f64,
    pub entry_logic: String,
    pub exit_logic: String,

    // Update side
    pub update_sl_logic: String,
    pub update_tp_logic: String,

    // Close side (all zero/empty until finalized)
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub close_time: Option<DateTime<Utc>>,
    pub close_price: f64,
    pub close_quantity: f64,
    pub close_order_id: i64,
    pub close_reason: String,
    pub close_cycle_num: i64,
    pub is_forced: bool,
    pub forced_reason: String,
    pub close_logic: String,
    pub forced_close_logic: String,
    pub duration: String,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub was_stop_loss: bool,
    pub success: bool,
    pub error: String,
}

impl TradeRecord {
    /// Canonical secondary key: `{symbol}_{side}_{open_epoch_secs}`
    pub fn make_trade_id(symbol: &str, side: &str, open_time: DateTime<Utc>) -> String {
        format!("{}_{}_{}", symbol, side, open_time.timestamp())
    }
}

/// Close-side fields applied when a row is finalized
#[derive(Debug, Clone)]
pub struct TradeClose {
    pub close_time: DateTime<Utc>,
    pub close_price: f64,
    pub close_quantity: f64,
    pub close_order_id: i64,
    pub close_reason: String,
    pub close_cycle_num: i64,
    pub is_forced: bool,
    pub forced_reason: String,
    pub close_logic: String,
    pub forced_close_logic: String,
    pub duration: String,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub was_stop_loss: bool,
    pub success: bool,
    pub error: String,
}

/// Partial update for a trade row; only non-empty fields participate
#[derive(Debug, Clone, Default)]
pub struct TradeUpdate {
    pub entry_logic: Option<String>,
    pub exit_logic: Option<String>,
    pub update_sl_logic: Option<String>,
    pub update_tp_logic: Option<String>,
    pub close: Option<TradeClose>,
}

impl TradeUpdate {
    pub fn is_empty(&self) -> bool {
        self.entry_logic.is_none()
            && self.exit_logic.is_none()
            && self.update_sl_logic.is_none()
            && self.update_tp_logic.is_none()
            && self.close.is_none()
    }
}

pub struct TradeStore {
    db: Db,
}

impl TradeStore {
    pub fn new(db: Db) -> StorageResult<Self> {
        let store = Self { db };
        store.init_table()?;
        Ok(store)
    }

    fn init_table(&self) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open_price REAL NOT NULL,
                open_quantity REAL NOT NULL,
                open_leverage INTEGER NOT NULL,
                open_order_id INTEGER NOT NULL DEFAULT 0,
                open_reason TEXT NOT NULL DEFAULT '',
                open_cycle_num INTEGER NOT NULL DEFAULT 0,
                position_value REAL NOT NULL DEFAULT 0,
                margin_used REAL NOT NULL DEFAULT 0,
                entry_logic TEXT NOT NULL DEFAULT '',
                exit_logic TEXT NOT NULL DEFAULT '',
                update_sl_logic TEXT NOT NULL DEFAULT '',
                update_tp_logic TEXT NOT NULL DEFAULT '',
                close_time INTEGER,
                close_price REAL NOT NULL DEFAULT 0,
                close_quantity REAL NOT NULL DEFAULT 0,
                close_order_id INTEGER NOT NULL DEFAULT 0,
                close_reason TEXT NOT NULL DEFAULT '',
                close_cycle_num INTEGER NOT NULL DEFAULT 0,
                is_forced INTEGER NOT NULL DEFAULT 0,
                forced_reason TEXT NOT NULL DEFAULT '',
                close_logic TEXT NOT NULL DEFAULT '',
                forced_close_logic TEXT NOT NULL DEFAULT '',
                duration TEXT NOT NULL DEFAULT '',
                pnl REAL NOT NULL DEFAULT 0,
                pnl_pct REAL NOT NULL DEFAULT 0,
                was_stop_loss INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT 0,
                UNIQUE(symbol, open_time)
            );
            CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);
            CREATE INDEX IF NOT EXISTS idx_trades_open_time ON trades(open_time);
            CREATE INDEX IF NOT EXISTS idx_trades_close_time ON trades(close_time);
            CREATE INDEX IF NOT EXISTS idx_trades_close_order ON trades(close_order_id);",
        )?;
        Ok(())
    }

    /// Insert a new trade row. Fails if the (symbol, open_time) key exists.
    pub fn create_trade(&self, trade: &TradeRecord) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO trades (
                trade_id, symbol, side, open_time, open_price, open_quantity,
                open_leverage, open_order_id, open_reason, open_cycle_num,
                position_value, margin_used, entry_logic, exit_logic,
                update_sl_logic, update_tp_logic,
                close_time, close_price, close_quantity, close_order_id,
                close_reason, close_cycle_num, is_forced, forced_reason,
                close_logic, forced_close_logic, duration, pnl, pnl_pct,
                was_stop_loss, success, error, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                      ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24,
                      ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33)",
            params![
                trade.trade_id,
                trade.symbol,
                trade.side,
                trade.open_time.timestamp_millis(),
                trade.open_price,
                trade.open_quantity,
                trade.open_leverage,
                trade.open_order_id,
                trade.open_reason,
                trade.open_cycle_num,
                trade.position_value,
                trade.margin_used,
                trade.entry_logic,
                trade.exit_logic,
                trade.update_sl_logic,
                trade.update_tp_logic,
                trade.close_time.map(|t| t.timestamp_millis()),
                trade.close_price,
                trade.close_quantity,
                trade.close_order_id,
                trade.close_reason,
                trade.close_cycle_num,
                trade.is_forced as i64,
                trade.forced_reason,
                trade.close_logic,
                trade.forced_close_logic,
                trade.duration,
                trade.pnl,
                trade.pnl_pct,
                trade.was_stop_loss as i64,
                trade.success as i64,
                trade.error,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Update an existing trade row in place.
    ///
    /// The SET clause is built dynamically from only the fields present in
    /// `update`. If a close is supplied, the close columns are finalized as
    /// well; finalizing requires exactly one of close_logic /
    /// forced_close_logic to be non-empty, and only non-finalized rows are
    /// touched. Zero affected rows maps to `StorageError::NotFound`.
    pub fn update_trade(&self, trade_id: &str, update: &TradeUpdate) -> StorageResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        if let Some(close) = &update.close {
            let has_close_logic = !close.close_logic.is_empty();
            let has_forced_logic = !close.forced_close_logic.is_empty();
            if has_close_logic && has_forced_logic {
                return Err(StorageError::Invalid(
                    "close_logic and forced_close_logic are mutually exclusive".to_string(),
                ));
            }
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(v) = &update.entry_logic {
            if !v.is_empty() {
                sets.push("entry_logic = ?");
                values.push(Box::new(v.clone()));
            }
        }
        if let Some(v) = &update.exit_logic {
            if !v.is_empty() {
                sets.push("exit_logic = ?");
                values.push(Box::new(v.clone()));
            }
        }
        if let Some(v) = &update.update_sl_logic {
            if !v.is_empty() {
                sets.push("update_sl_logic = ?");
                values.push(Box::new(v.clone()));
            }
        }
        if let Some(v) = &update.update_tp_logic {
            if !v.is_empty() {
                sets.push("update_tp_logic = ?");
                values.push(Box::new(v.clone()));
            }
        }

        let finalizing = update.close.is_some();
        if let Some(close) = &update.close {
            sets.push("close_time = ?");
            values.push(Box::new(close.close_time.timestamp_millis()));
            sets.push("close_price = ?");
            values.push(Box::new(close.close_price));
            sets.push("close_quantity = ?");
            values.push(Box::new(close.close_quantity));
            sets.push("close_order_id = ?");
            values.push(Box::new(close.close_order_id));
            sets.push("close_reason = ?");
            values.push(Box::new(close.close_reason.clone()));
            sets.push("close_cycle_num = ?");
            values.push(Box::new(close.close_cycle_num));
            sets.push("is_forced = ?");
            values.push(Box::new(close.is_forced as i64));
            sets.push("forced_reason = ?");
            values.push(Box::new(close.forced_reason.clone()));
            sets.push("close_logic = ?");
            values.push(Box::new(close.close_logic.clone()));
            sets.push("forced_close_logic = ?");
            values.push(Box::new(close.forced_close_logic.clone()));
            sets.push("duration = ?");
            values.push(Box::new(close.duration.clone()));
            sets.push("pnl = ?");
            values.push(Box::new(close.pnl));
            sets.push("pnl_pct = ?");
            values.push(Box::new(close.pnl_pct));
            sets.push("was_stop_loss = ?");
            values.push(Box::new(close.was_stop_loss as i64));
            sets.push("success = ?");
            values.push(Box::new(close.success as i64));
            sets.push("error = ?");
            values.push(Box::new(close.error.clone()));
        }

        if sets.is_empty() {
            return Ok(());
        }

        // A finalizing update must not overwrite an existing finalization
        let sql = if finalizing {
            format!(
                "UPDATE trades SET {} WHERE trade_id = ? AND close_time IS NULL",
                sets.join(", ")
            )
        } else {
            format!("UPDATE trades SET {} WHERE trade_id = ?", sets.join(", "))
        };
        values.push(Box::new(trade_id.to_string()));

        let conn = self.db.lock().unwrap();
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
        let affected = conn.execute(&sql, refs.as_slice())?;

        if affected == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    /// Insert the row, or overwrite a non-finalized row with the same
    /// trade_id. Finalized rows are left untouched, which makes this the
    /// safe upsert for recovery paths.
    pub fn create_or_update_trade(&self, trade: &TradeRecord) -> StorageResult<()> {
        {
            let conn = self.db.lock().unwrap();
            let affected = conn.execute(
                "UPDATE trades SET
                    symbol = ?2, side = ?3, open_time = ?4, open_price = ?5,
                    open_quantity = ?6, open_leverage = ?7, open_order_id = ?8,
                    open_reason = ?9, open_cycle_num = ?10, position_value = ?11,
                    margin_used = ?12,
                    close_time = ?13, close_price = ?14, close_quantity = ?15,
                    close_order_id = ?16, close_reason = ?17, close_cycle_num = ?18,
                    is_forced = ?19, forced_reason = ?20, close_logic = ?21,
                    forced_close_logic = ?22, duration = ?23, pnl = ?24,
                    pnl_pct = ?25, was_stop_loss = ?26, success = ?27, error = ?28
                 WHERE trade_id = ?1 AND close_time IS NULL",
                params![
                    trade.trade_id,
                    trade.symbol,
                    trade.side,
                    trade.open_time.timestamp_millis(),
                    trade.open_price,
                    trade.open_quantity,
                    trade.open_leverage,
                    trade.open_order_id,
                    trade.open_reason,
                    trade.open_cycle_num,
                    trade.position_value,
                    trade.margin_used,
                    trade.close_time.map(|t| t.timestamp_millis()),
                    trade.close_price,
                    trade.close_quantity,
                    trade.close_order_id,
                    trade.close_reason,
                    trade.close_cycle_num,
                    trade.is_forced as i64,
                    trade.forced_reason,
                    trade.close_logic,
                    trade.forced_close_logic,
                    trade.duration,
                    trade.pnl,
                    trade.pnl_pct,
                    trade.was_stop_loss as i64,
                    trade.success as i64,
                    trade.error,
                ],
            )?;
            if affected > 0 {
                return Ok(());
            }

            // Row may exist but be finalized already; leave it alone
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM trades WHERE trade_id = ?1",
                    params![trade.trade_id],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if exists {
                return Ok(());
            }
        }

        self.create_trade(trade)
    }

    /// Look up the open (non-finalized) trade for a position, matching
    /// open_time within a ±10 s window, closest first.
    pub fn get_open_trade_by_time_and_side(
        &self,
        symbol: &str,
        open_time: DateTime<Utc>,
        side: &str,
    ) -> StorageResult<Option<TradeRecord>> {
        let ms = open_time.timestamp_millis();
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM trades
             WHERE symbol = ?1 AND side = ?2 AND close_time IS NULL
               AND open_time BETWEEN ?3 AND ?4
             ORDER BY ABS(open_time - ?5) ASC
             LIMIT 1",
        )?;

        let mut rows = stmt.query(params![symbol, side, ms - 10_000, ms + 10_000, ms])?;
        match rows.next()? {
            Some(row) => Ok(Some(scan_trade(row)?)),
            None => Ok(None),
        }
    }

    /// Fetch a single row by trade id
    pub fn get_trade(&self, trade_id: &str) -> StorageResult<Option<TradeRecord>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM trades WHERE trade_id = ?1")?;
        let mut rows = stmt.query(params![trade_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(scan_trade(row)?)),
            None => Ok(None),
        }
    }

    /// Latest N trades ordered by close time (finalized first, newest first)
    pub fn get_latest_trades(&self, n: usize) -> StorageResult<Vec<TradeRecord>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM trades
             ORDER BY COALESCE(close_time, open_time) DESC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![n as i64])?;

        let mut trades = Vec::new();
        while let Some(row) = rows.next()? {
            trades.push(scan_trade(row)?);
        }
        Ok(trades)
    }

    /// Trades for a symbol closed within the last `days` days
    pub fn get_trades_by_symbol(&self, symbol: &str, days: i64) -> StorageResult<Vec<TradeRecord>> {
        let cutoff = Utc::now().timestamp_millis() - days * 24 * 3600 * 1000;
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM trades
             WHERE symbol = ?1 AND close_time IS NOT NULL AND close_time >= ?2
             ORDER BY close_time DESC",
        )?;
        let mut rows = stmt.query(params![symbol, cutoff])?;

        let mut trades = Vec::new();
        while let Some(row) = rows.next()? {
            trades.push(scan_trade(row)?);
        }
        Ok(trades)
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn scan_trade(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
    let close_time_ms: Option<i64> = row.get("close_time")?;
    Ok(TradeRecord {
        trade_id: row.get("trade_id")?,
        symbol: row.get("symbol")?,
        side: row.get("side")?,
        open_time: ms_to_datetime(row.get("open_time")?),
        open_price: row.get("open_price")?,
        open_quantity: row.get("open_quantity")?,
        open_leverage: row.get("open_leverage")?,
        open_order_id: row.get("open_order_id")?,
        open_reason: row.get("open_reason")?,
        open_cycle_num: row.get("open_cycle_num")?,
        position_value: row.get("position_value")?,
        margin_used: row.get("margin_used")?,
        entry_logic: row.get("entry_logic")?,
        exit_logic: row.get("exit_logic")?,
        update_sl_logic: row.get("update_sl_logic")?,
        update_tp_logic: row.get("update_tp_logic")?,
        close_time: close_time_ms.map(ms_to_datetime),
        close_price: row.get("close_price")?,
        close_quantity: row.get("close_quantity")?,
        close_order_id: row.get("close_order_id")?,
        close_reason: row.get("close_reason")?,
        close_cycle_num: row.get("close_cycle_num")?,
        is_forced: row.get::<_, i64>("is_forced")? != 0,
        forced_reason: row.get("forced_reason")?,
        close_logic: row.get("close_logic")?,
        forced_close_logic: row.get("forced_close_logic")?,
        duration: row.get("duration")?,
        pnl: row.get("pnl")?,
        pnl_pct: row.get("pnl_pct")?,
        was_stop_loss: row.get::<_, i64>("was_stop_loss")? != 0,
        success: row.get::<_, i64>("success")? != 0,
        error: row.get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_memory_db;
    use chrono::Duration;

    fn store() -> TradeStore {
        TradeStore::new(in_memory_db()).unwrap()
    }

    fn open_trade(symbol: &str, side: &str, open_time: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            trade_id: TradeRecord::make_trade_id(symbol, side, open_time),
            symbol: symbol.to_string(),
            side: side.to_string(),
            open_time,
            open_price: 60_000.0,
            open_quantity: 0.033,
            open_leverage: 10,
            open_order_id: 42,
            open_reason: "breakout".to_string(),
            open_cycle_num: 7,
            position_value: 1980.0,
            margin_used: 198.0,
            ..Default::default()
        }
    }

    fn close_at(t: DateTime<Utc>) -> TradeClose {
        TradeClose {
            close_time: t,
            close_price: 61_000.0,
            close_quantity: 0.033,
            close_order_id: 43,
            close_reason: "target".to_string(),
            close_cycle_num: 9,
            is_forced: false,
            forced_reason: String::new(),
            close_logic: "took profit at resistance".to_string(),
            forced_close_logic: String::new(),
            duration: "2h".to_string(),
            pnl: 33.0,
            pnl_pct: 16.7,
            was_stop_loss: false,
            success: true,
            error: String::new(),
        }
    }

    #[test]
    fn test_create_and_lookup_within_window() {
        let store = store();
        let t0 = Utc::now();
        store.create_trade(&open_trade("BTCUSDT", "long", t0)).unwrap();

        // 8 seconds off is inside the ±10 s window
        let found = store
            .get_open_trade_by_time_and_side("BTCUSDT", t0 + Duration::seconds(8), "long")
            .unwrap();
        assert!(found.is_some());

        // 12 seconds off is outside
        let missed = store
            .get_open_trade_by_time_and_side("BTCUSDT", t0 + Duration::seconds(12), "long")
            .unwrap();
        assert!(missed.is_none());

        // Wrong side never matches
        let wrong_side = store
            .get_open_trade_by_time_and_side("BTCUSDT", t0, "short")
            .unwrap();
        assert!(wrong_side.is_none());
    }

    #[test]
    fn test_window_picks_closest_row() {
        let store = store();
        let t0 = Utc::now();
        store.create_trade(&open_trade("ETHUSDT", "long", t0)).unwrap();
        store
            .create_trade(&open_trade("ETHUSDT", "long", t0 + Duration::seconds(9)))
            .unwrap();

        let found = store
            .get_open_trade_by_time_and_side("ETHUSDT", t0 + Duration::seconds(8), "long")
            .unwrap()
            .unwrap();
        assert_eq!(found.open_time.timestamp(), (t0 + Duration::seconds(9)).timestamp());
    }

    #[test]
    fn test_update_trade_not_found() {
        let store = store();
        let update = TradeUpdate {
            update_sl_logic: Some("moved stop".to_string()),
            ..Default::default()
        };
        match store.update_trade("missing_id", &update) {
            Err(StorageError::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_finalize_then_lookup_excludes_closed() {
        let store = store();
        let t0 = Utc::now();
        let trade = open_trade("BTCUSDT", "long", t0);
        store.create_trade(&trade).unwrap();

        let update = TradeUpdate {
            close: Some(close_at(t0 + Duration::hours(2))),
            ..Default::default()
        };
        store.update_trade(&trade.trade_id, &update).unwrap();

        // Finalized rows are no longer "open"
        let found = store
            .get_open_trade_by_time_and_side("BTCUSDT", t0, "long")
            .unwrap();
        assert!(found.is_none());

        let row = store.get_trade(&trade.trade_id).unwrap().unwrap();
        assert!(row.close_time.is_some());
        assert_eq!(row.close_logic, "took profit at resistance");
        assert!(row.forced_close_logic.is_empty());
    }

    #[test]
    fn test_double_finalization_rejected() {
        let store = store();
        let t0 = Utc::now();
        let trade = open_trade("BTCUSDT", "long", t0);
        store.create_trade(&trade).unwrap();

        let update = TradeUpdate {
            close: Some(close_at(t0 + Duration::hours(1))),
            ..Default::default()
        };
        store.update_trade(&trade.trade_id, &update).unwrap();

        // A second finalization targets zero rows
        let mut second = close_at(t0 + Duration::hours(3));
        second.close_price = 99.0;
        let update2 = TradeUpdate {
            close: Some(second),
            ..Default::default()
        };
        match store.update_trade(&trade.trade_id, &update2) {
            Err(StorageError::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.err()),
        }

        let row = store.get_trade(&trade.trade_id).unwrap().unwrap();
        assert_eq!(row.close_price, 61_000.0);
    }

    #[test]
    fn test_both_close_logics_rejected() {
        let store = store();
        let t0 = Utc::now();
        let trade = open_trade("BTCUSDT", "long", t0);
        store.create_trade(&trade).unwrap();

        let mut close = close_at(t0 + Duration::hours(1));
        close.forced_close_logic = "loss exceeded threshold".to_string();
        let update = TradeUpdate {
            close: Some(close),
            ..Default::default()
        };
        match store.update_trade(&trade.trade_id, &update) {
            Err(StorageError::Invalid(_)) => {}
            other => panic!("expected Invalid, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_create_or_update_preserves_finalized_rows() {
        let store = store();
        let t0 = Utc::now();
        let mut trade = open_trade("BTCUSDT", "long", t0);
        store.create_trade(&trade).unwrap();
        store
            .update_trade(
                &trade.trade_id,
                &TradeUpdate {
                    close: Some(close_at(t0 + Duration::hours(1))),
                    ..Default::default()
                },
            )
            .unwrap();

        // Upsert with the same id must not disturb the finalized row
        trade.open_price = 1.0;
        store.create_or_update_trade(&trade).unwrap();

        let row = store.get_trade(&trade.trade_id).unwrap().unwrap();
        assert_eq!(row.open_price, 60_000.0);
    }

    #[test]
    fn test_partial_update_only_touches_given_fields() {
        let store = store();
        let t0 = Utc::now();
        let trade = open_trade("BTCUSDT", "long", t0);
        store.create_trade(&trade).unwrap();

        store
            .update_trade(
                &trade.trade_id,
                &TradeUpdate {
                    update_sl_logic: Some("trail to 59k".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let row = store.get_trade(&trade.trade_id).unwrap().unwrap();
        assert_eq!(row.update_sl_logic, "trail to 59k");
        assert_eq!(row.open_reason, "breakout");
        assert!(row.close_time.is_none());
    }

    #[test]
    fn test_latest_trades_and_by_symbol() {
        let store = store();
        let t0 = Utc::now() - Duration::hours(5);
        for (i, sym) in ["BTCUSDT", "ETHUSDT", "BTCUSDT"].iter().enumerate() {
            let t = t0 + Duration::hours(i as i64);
            let trade = open_trade(sym, "long", t);
            store.create_trade(&trade).unwrap();
            store
                .update_trade(
                    &trade.trade_id,
                    &TradeUpdate {
                        close: Some(close_at(t + Duration::minutes(30))),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let latest = store.get_latest_trades(2).unwrap();
        assert_eq!(latest.len(), 2);
        assert!(latest[0].close_time.unwrap() >= latest[1].close_time.unwrap());

        let btc = store.get_trades_by_symbol("BTCUSDT", 7).unwrap();
        assert_eq!(btc.len(), 2);
    }
}
