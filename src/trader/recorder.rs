//! Trade-history recorder
//!
//! Pairs an open action with a close action into one durable TradeRecord.
//! When the open row cannot be found (restart, position opened outside the
//! agent) the open side is reconstructed from a chain of sources, from most
//! to least authoritative; if no open price can be recovered the close is
//! logged and skipped rather than fabricated.

use super::guards::position_key;
use super::DecisionAction;
use crate::exchange::ExchangeClient;
use crate::logger::{self, LogTag};
use crate::storage::{
    DecisionStore, PositionLogicManager, StorageError, TradeClose, TradeRecord, TradeStore,
    TradeUpdate,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Render the close reason for consumers, highest-priority source first
pub fn resolve_close_reason(trade: &TradeRecord) -> String {
    if !trade.close_logic.is_empty() {
        return trade.close_logic.clone();
    }
    if trade.was_stop_loss && !trade.update_sl_logic.is_empty() {
        return trade.update_sl_logic.clone();
    }
    if !trade.forced_close_logic.is_empty() {
        return trade.forced_close_logic.clone();
    }
    if !trade.exit_logic.is_empty() {
        return trade.exit_logic.clone();
    }
    if !trade.close_reason.is_empty() {
        return trade.close_reason.clone();
    }
    "unspecified".to_string()
}

/// Compute the full TradeRecord for an (open, close) action pair
#[allow(clippy::too_many_arguments)]
pub fn build_trade_record(
    symbol: &str,
    side: &str,
    open: &DecisionAction,
    close: &DecisionAction,
    open_cycle: i64,
    close_cycle: i64,
    is_forced: bool,
    forced_reason: &str,
    open_reason: &str,
    close_reason: &str,
) -> TradeRecord {
    let pnl = if side == "long" {
        open.quantity * (close.price - open.price)
    } else {
        open.quantity * (open.price - close.price)
    };

    let position_value = open.quantity * open.price;
    let margin_used = if open.leverage > 0 {
        position_value / open.leverage as f64
    } else {
        position_value
    };
    let pnl_pct = if margin_used > 0.0 {
        pnl / margin_used * 100.0
    } else {
        0.0
    };

    let duration = close.timestamp - open.timestamp;
    let was_stop_loss = is_forced && pnl < 0.0;

    TradeRecord {
        trade_id: TradeRecord::make_trade_id(symbol, side, open.timestamp),
        symbol: symbol.to_string(),
        side: side.to_string(),
        open_time: open.timestamp,
        open_price: open.price,
        open_quantity: open.quantity,
        open_leverage: open.leverage,
        open_order_id: open.order_id,
        open_reason: open_reason.to_string(),
        open_cycle_num: open_cycle,
        position_value,
        margin_used,
        close_time: Some(close.timestamp),
        close_price: close.price,
        close_quantity: close.quantity,
        close_order_id: close.order_id,
        close_reason: close_reason.to_string(),
        close_cycle_num: close_cycle,
        is_forced,
        forced_reason: forced_reason.to_string(),
        duration: format_duration(duration),
        pnl,
        pnl_pct,
        was_stop_loss,
        success: open.success && close.success,
        error: close.error.clone(),
        ..Default::default()
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds().max(0);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Wires the recorder to its stores and recovery sources
pub struct TradeRecorder {
    trader_id: String,
    trades: Arc<TradeStore>,
    decisions: Arc<DecisionStore>,
    logic_manager: Arc<PositionLogicManager>,
    exchange: Arc<dyn ExchangeClient>,
    first_seen: Arc<RwLock<HashMap<String, i64>>>,
}

impl TradeRecorder {
    pub fn new(
        trader_id: &str,
        trades: Arc<TradeStore>,
        decisions: Arc<DecisionStore>,
        logic_manager: Arc<PositionLogicManager>,
        exchange: Arc<dyn ExchangeClient>,
        first_seen: Arc<RwLock<HashMap<String, i64>>>,
    ) -> Self {
        Self {
            trader_id: trader_id.to_string(),
            trades,
            decisions,
            logic_manager,
            exchange,
            first_seen,
        }
    }

    /// Finalize the trade row for a close.
    ///
    /// `open_hint` carries whatever the caller already knows about the open
    /// side (entry price / quantity / leverage from the position that was
    /// just closed); the open time is resolved through the recovery chain.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_close(
        &self,
        symbol: &str,
        side: &str,
        close: &DecisionAction,
        open_hint: Option<&DecisionAction>,
        close_cycle: i64,
        is_forced: bool,
        forced_reason: &str,
        close_logic: &str,
    ) {
        // 1. Find the open time, then the open row
        let open_time = self.recover_open_time(symbol, side, close.timestamp).await;

        if let Some(open_time) = open_time {
            if let Ok(Some(existing)) =
                self.trades
                    .get_open_trade_by_time_and_side(symbol, open_time, side)
            {
                let probe = DecisionAction {
                    price: existing.open_price,
                    quantity: existing.open_quantity,
                    leverage: existing.open_leverage,
                    order_id: existing.open_order_id,
                    timestamp: existing.open_time,
                    success: true,
                    ..Default::default()
                };
                let computed = build_trade_record(
                    symbol,
                    side,
                    &probe,
                    close,
                    existing.open_cycle_num,
                    close_cycle,
                    is_forced,
                    forced_reason,
                    &existing.open_reason,
                    close_logic,
                );

                let update = TradeUpdate {
                    close: Some(TradeClose {
                        close_time: close.timestamp,
                        close_price: close.price,
                        close_quantity: close.quantity,
                        close_order_id: close.order_id,
                        close_reason: close_logic.to_string(),
                        close_cycle_num: close_cycle,
                        is_forced,
                        forced_reason: forced_reason.to_string(),
                        close_logic: if is_forced { String::new() } else { close_logic.to_string() },
                        forced_close_logic: if is_forced {
                            forced_reason.to_string()
                        } else {
                            String::new()
                        },
                        duration: computed.duration.clone(),
                        pnl: computed.pnl,
                        pnl_pct: computed.pnl_pct,
                        was_stop_loss: computed.was_stop_loss,
                        success: computed.success,
                        error: close.error.clone(),
                    }),
                    ..Default::default()
                };

                match self.trades.update_trade(&existing.trade_id, &update) {
                    Ok(()) => {
                        logger::info(
                            LogTag::Trader,
                            &format!(
                                "trade finalized: {} {} pnl {:.2} USDT ({:.2}%)",
                                symbol, side, computed.pnl, computed.pnl_pct
                            ),
                        );
                        return;
                    }
                    Err(StorageError::NotFound) => {
                        logger::warning(
                            LogTag::Trader,
                            &format!(
                                "trade row for {} {} vanished during finalize, falling back to upsert",
                                symbol, side
                            ),
                        );
                    }
                    Err(e) => {
                        logger::error(
                            LogTag::Trader,
                            &format!("failed to finalize trade row for {} {}: {}", symbol, side, e),
                        );
                        return;
                    }
                }
            }
        }

        // 2. No row found: reconstruct the open side
        let open = self
            .reconstruct_open_action(symbol, side, close, open_hint, open_time)
            .await;

        let Some(open) = open else {
            logger::warning(
                LogTag::Trader,
                &format!(
                    "cannot recover open information for {} {}, skipping trade record",
                    symbol, side
                ),
            );
            return;
        };

        let mut trade = build_trade_record(
            symbol,
            side,
            &open,
            close,
            0,
            close_cycle,
            is_forced,
            forced_reason,
            "recovered open",
            close_logic,
        );
        if is_forced {
            trade.forced_close_logic = forced_reason.to_string();
        } else {
            trade.close_logic = close_logic.to_string();
        }

        match self.trades.create_or_update_trade(&trade) {
            Ok(()) => logger::info(
                LogTag::Trader,
                &format!(
                    "trade recorded via recovery path: {} {} pnl {:.2} USDT ({:.2}%)",
                    symbol, side, trade.pnl, trade.pnl_pct
                ),
            ),
            Err(e) => logger::error(
                LogTag::Trader,
                &format!("failed to upsert recovered trade for {} {}: {}", symbol, side, e),
            ),
        }
    }

    /// Open-time recovery chain: in-memory map, logic store, local trade
    /// history, venue fills, decision records.
    async fn recover_open_time(
        &self,
        symbol: &str,
        side: &str,
        close_time: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let key = position_key(symbol, side);

        // (a) in-memory map, authoritative for positions opened this run
        if let Some(&ms) = self.first_seen.read().unwrap().get(&key) {
            if ms > 0 {
                return Utc.timestamp_millis_opt(ms).single();
            }
        }

        // (b) position-logic store
        if let Some(ms) = self.logic_manager.get_first_seen_time(symbol, side) {
            return Utc.timestamp_millis_opt(ms).single();
        }

        // (c) most recent local trade opened before the close
        if let Ok(trades) = self.trades.get_latest_trades(500) {
            let best = trades
                .iter()
                .filter(|t| t.symbol == symbol && t.side == side && t.open_time < close_time)
                .max_by_key(|t| t.open_time);
            if let Some(trade) = best {
                return Some(trade.open_time);
            }
        }

        // (d) latest open-direction venue fill before the close
        let open_fill_side = if side == "long" { "BUY" } else { "SELL" };
        let start = close_time.timestamp_millis() - 7 * 24 * 3600 * 1000;
        if let Ok(fills) = self
            .exchange
            .get_account_trades(Some(symbol), start, close_time.timestamp_millis(), 1000)
            .await
        {
            let best = fills
                .iter()
                .filter(|f| {
                    f.side == open_fill_side
                        && f.realized_pnl == 0.0
                        && f.time_ms < close_time.timestamp_millis()
                })
                .max_by_key(|f| f.time_ms);
            if let Some(fill) = best {
                return Utc.timestamp_millis_opt(fill.time_ms).single();
            }
        }

        // (e) most recent matching open decision in the decision records
        if let Ok(records) = self.decisions.get_latest_records(&self.trader_id, 100) {
            let wanted = format!("open_{}", side);
            for record in records {
                let Some(actions) = record.decisions.as_array() else {
                    continue;
                };
                for action in actions {
                    if action.get("action").and_then(|v| v.as_str()) == Some(wanted.as_str())
                        && action.get("symbol").and_then(|v| v.as_str()) == Some(symbol)
                        && record.timestamp < close_time
                    {
                        return Some(record.timestamp);
                    }
                }
            }
        }

        None
    }

    /// Fill in price/quantity/leverage for a reconstructed open
    async fn reconstruct_open_action(
        &self,
        symbol: &str,
        side: &str,
        close: &DecisionAction,
        open_hint: Option<&DecisionAction>,
        open_time: Option<DateTime<Utc>>,
    ) -> Option<DecisionAction> {
        let mut open = open_hint.cloned().unwrap_or_default();
        open.symbol = symbol.to_string();
        open.action = format!("open_{}", side);
        open.success = true;

        if let Some(t) = open_time {
            open.timestamp = t;
        } else if open.timestamp.timestamp_millis() == 0 {
            // Last resort so duration stays plausible
            open.timestamp = close.timestamp - chrono::Duration::hours(1);
        }

        // Entry price from recent local history when the hint lacks it
        if open.price == 0.0 {
            if let Ok(trades) = self.trades.get_latest_trades(100) {
                if let Some(trade) = trades
                    .iter()
                    .find(|t| t.symbol == symbol && t.side == side && t.open_price > 0.0)
                {
                    open.price = trade.open_price;
                    if open.quantity == 0.0 {
                        open.quantity = trade.open_quantity;
                    }
                    if open.leverage == 0 {
                        open.leverage = trade.open_leverage;
                    }
                }
            }
        }

        // Never fabricate a price
        if open.price == 0.0 {
            return None;
        }

        if open.quantity == 0.0 {
            open.quantity = close.quantity;
        }
        if open.leverage == 0 {
            open.leverage = if close.leverage > 0 { close.leverage } else { 10 };
        }

        Some(open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(price: f64, qty: f64, leverage: u32, at: DateTime<Utc>) -> DecisionAction {
        DecisionAction {
            price,
            quantity: qty,
            leverage,
            timestamp: at,
            success: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_long_pnl_math() {
        let t0 = Utc::now();
        let open = action(60_000.0, 0.033, 10, t0);
        let close = action(61_000.0, 0.033, 10, t0 + chrono::Duration::hours(2));

        let trade = build_trade_record(
            "BTCUSDT", "long", &open, &close, 1, 2, false, "", "entry", "exit",
        );

        assert!((trade.pnl - 33.0).abs() < 1e-9);
        assert!((trade.position_value - 1_980.0).abs() < 1e-9);
        assert!((trade.margin_used - 198.0).abs() < 1e-9);
        assert!((trade.pnl_pct - 33.0 / 198.0 * 100.0).abs() < 1e-9);
        assert_eq!(trade.duration, "2h0m0s");
        assert!(!trade.was_stop_loss);
        assert!(trade.success);
    }

    #[test]
    fn test_short_pnl_math() {
        let t0 = Utc::now();
        let open = action(2_000.0, 3.0, 5, t0);
        let close = action(1_950.0, 3.0, 5, t0 + chrono::Duration::minutes(45));

        let trade = build_trade_record(
            "ETHUSDT", "short", &open, &close, 1, 2, false, "", "", "",
        );

        // Short profits when price falls: 3 * (2000 - 1950) = 150
        assert!((trade.pnl - 150.0).abs() < 1e-9);
        assert_eq!(trade.duration, "45m0s");
    }

    #[test]
    fn test_forced_losing_close_flags_stop_loss() {
        let t0 = Utc::now();
        let open = action(60_000.0, 0.1, 10, t0);
        let close = action(58_900.0, 0.1, 10, t0 + chrono::Duration::minutes(5));

        let trade = build_trade_record(
            "BTCUSDT",
            "long",
            &open,
            &close,
            1,
            2,
            true,
            "position loss 18.33% exceeds 10.00%",
            "",
            "",
        );

        assert!(trade.pnl < 0.0);
        assert!(trade.was_stop_loss);
        assert!(trade.is_forced);
    }

    #[test]
    fn test_forced_winning_close_is_not_stop_loss() {
        let t0 = Utc::now();
        let open = action(60_000.0, 0.1, 10, t0);
        let close = action(61_500.0, 0.1, 10, t0 + chrono::Duration::minutes(5));

        let trade =
            build_trade_record("BTCUSDT", "long", &open, &close, 1, 2, true, "take profit", "", "");
        assert!(trade.pnl > 0.0);
        assert!(!trade.was_stop_loss);
    }

    #[test]
    fn test_close_reason_priority() {
        let mut trade = TradeRecord {
            close_reason: "legacy".to_string(),
            exit_logic: "exit plan".to_string(),
            forced_close_logic: "forced".to_string(),
            update_sl_logic: "sl moved".to_string(),
            close_logic: "ai close".to_string(),
            was_stop_loss: true,
            ..Default::default()
        };

        assert_eq!(resolve_close_reason(&trade), "ai close");

        trade.close_logic.clear();
        assert_eq!(resolve_close_reason(&trade), "sl moved");

        trade.was_stop_loss = false;
        assert_eq!(resolve_close_reason(&trade), "forced");

        trade.forced_close_logic.clear();
        assert_eq!(resolve_close_reason(&trade), "exit plan");

        trade.exit_logic.clear();
        assert_eq!(resolve_close_reason(&trade), "legacy");

        trade.close_reason.clear();
        assert_eq!(resolve_close_reason(&trade), "unspecified");
    }

    #[test]
    fn test_duration_formatting() {
        assert_eq!(format_duration(chrono::Duration::seconds(59)), "59s");
        assert_eq!(format_duration(chrono::Duration::seconds(61)), "1m1s");
        assert_eq!(format_duration(chrono::Duration::seconds(3_725)), "1h2m5s");
    }
}
