//! Per-cycle decision records (append-only)
//!
//! Every LLM cycle and every watchdog intervention lands here; the read API
//! serves these rows verbatim. Structured payloads are stored as JSON text.

use super::{Db, StorageResult};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;

/// One persisted decision record
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StoredDecisionRecord {
    pub cycle_number: i64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub input_prompt: String,
    pub cot_trace: String,
    pub decision_json: String,
    /// JSON: account snapshot
    pub account_state: serde_json::Value,
    /// JSON: position snapshots
    pub positions: serde_json::Value,
    /// JSON: candidate symbols
    pub candidate_coins: serde_json::Value,
    /// JSON: executed decision actions
    pub decisions: serde_json::Value,
    /// JSON: human-readable execution log lines
    pub execution_log: serde_json::Value,
    pub success: bool,
    pub error_message: String,
}

pub struct DecisionStore {
    db: Db,
}

impl DecisionStore {
    pub fn new(db: Db) -> StorageResult<Self> {
        let store = Self { db };
        store.init_table()?;
        Ok(store)
    }

    fn init_table(&self) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trader_id TEXT NOT NULL,
                cycle_number INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                input_prompt TEXT NOT NULL DEFAULT '',
                cot_trace TEXT NOT NULL DEFAULT '',
                decision_json TEXT NOT NULL DEFAULT '',
                account_state TEXT NOT NULL DEFAULT '{}',
                positions TEXT NOT NULL DEFAULT '[]',
                candidate_coins TEXT NOT NULL DEFAULT '[]',
                decisions TEXT NOT NULL DEFAULT '[]',
                execution_log TEXT NOT NULL DEFAULT '[]',
                success INTEGER NOT NULL DEFAULT 0,
                error_message TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_decisions_trader_cycle ON decisions(trader_id, cycle_number);
            CREATE INDEX IF NOT EXISTS idx_decisions_timestamp ON decisions(timestamp);",
        )?;
        Ok(())
    }

    pub fn log_decision(&self, trader_id: &str, record: &StoredDecisionRecord) -> StorageResult<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO decisions (
                trader_id, cycle_number, timestamp, input_prompt, cot_trace,
                decision_json, account_state, positions, candidate_coins,
                decisions, execution_log, success, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                trader_id,
                record.cycle_number,
                record.timestamp.timestamp_millis(),
                record.input_prompt,
                record.cot_trace,
                record.decision_json,
                record.account_state.to_string(),
                record.positions.to_string(),
                record.candidate_coins.to_string(),
                record.decisions.to_string(),
                record.execution_log.to_string(),
                record.success as i64,
                record.error_message,
            ],
        )?;
        Ok(())
    }

    /// Latest N records for a trader, newest first
    pub fn get_latest_records(
        &self,
        trader_id: &str,
        n: usize,
    ) -> StorageResult<Vec<StoredDecisionRecord>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT cycle_number, timestamp, input_prompt, cot_trace, decision_json,
                    account_state, positions, candidate_coins, decisions, execution_log,
                    success, error_message
             FROM decisions
             WHERE trader_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![trader_id, n as i64])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let parse = |idx: usize| -> serde_json::Value {
                row.get::<_, String>(idx)
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(serde_json::Value::Null)
            };

            records.push(StoredDecisionRecord {
                cycle_number: row.get(0)?,
                timestamp: Utc
                    .timestamp_millis_opt(row.get(1)?)
                    .single()
                    .unwrap_or_default(),
                input_prompt: row.get(2)?,
                cot_trace: row.get(3)?,
                decision_json: row.get(4)?,
                account_state: parse(5),
                positions: parse(6),
                candidate_coins: parse(7),
                decisions: parse(8),
                execution_log: parse(9),
                success: row.get::<_, i64>(10)? != 0,
                error_message: row.get(11)?,
            });
        }
        Ok(records)
    }

    /// Render forced-close lines from the most recent records (oldest first)
    pub fn get_forced_closes(&self, trader_id: &str, max_records: usize) -> StorageResult<Vec<String>> {
        let records = self.get_latest_records(trader_id, max_records)?;

        let mut lines = Vec::new();
        for record in records.iter().rev() {
            let Some(actions) = record.decisions.as_array() else {
                continue;
            };
            for action in actions {
                let is_forced = action
                    .get("is_forced")
                    .map(|v| v.as_bool().unwrap_or(v.as_i64().unwrap_or(0) != 0))
                    .unwrap_or(false);
                if !is_forced {
                    continue;
                }
                let action_name = action.get("action").and_then(|v| v.as_str()).unwrap_or("");
                if action_name != "close_long" && action_name != "close_short" {
                    continue;
                }
                let symbol = action.get("symbol").and_then(|v| v.as_str()).unwrap_or("");
                let reason = action
                    .get("forced_reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                lines.push(format!(
                    "{}: {} {} - {} (cycle #{})",
                    record.timestamp.format("%H:%M:%S"),
                    symbol,
                    action_name,
                    reason,
                    record.cycle_number
                ));
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_memory_db;

    fn store() -> DecisionStore {
        DecisionStore::new(in_memory_db()).unwrap()
    }

    #[test]
    fn test_append_and_latest_ordering() {
        let store = store();
        for i in 0..3 {
            let record = StoredDecisionRecord {
                cycle_number: i,
                timestamp: Utc::now() + chrono::Duration::seconds(i),
                success: true,
                ..Default::default()
            };
            store.log_decision("alpha", &record).unwrap();
        }

        let records = store.get_latest_records("alpha", 2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cycle_number, 2);
        assert_eq!(records[1].cycle_number, 1);

        // Other traders see nothing
        assert!(store.get_latest_records("beta", 10).unwrap().is_empty());
    }

    #[test]
    fn test_forced_close_extraction() {
        let store = store();
        let record = StoredDecisionRecord {
            cycle_number: 0,
            timestamp: Utc::now(),
            decisions: serde_json::json!([
                {
                    "action": "close_long",
                    "symbol": "BTCUSDT",
                    "is_forced": true,
                    "forced_reason": "position loss 18.33% exceeds 10.00%"
                },
                {
                    "action": "open_short",
                    "symbol": "ETHUSDT",
                    "is_forced": false
                }
            ]),
            success: true,
            ..Default::default()
        };
        store.log_decision("alpha", &record).unwrap();

        let lines = store.get_forced_closes("alpha", 5).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("BTCUSDT close_long"));
        assert!(lines[0].contains("18.33%"));
    }
}
