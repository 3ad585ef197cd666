//! Venue-trade reconciliation
//!
//! Positions can be closed from the exchange UI while the agent runs.
//! Each cycle starts by pulling the last 7 days of fills, aggregating them
//! by order id and back-filling trade rows for close groups the local
//! history has never seen. Running the sync twice over the same history is
//! a no-op because close order ids are matched against existing rows.

use super::engine::AutoTrader;
use crate::exchange::AccountFill;
use crate::logger::{self, LogTag};
use crate::storage::TradeRecord;
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};

/// Fills aggregated per order id
#[derive(Debug, Clone)]
struct OrderGroup {
    order_id: i64,
    symbol: String,
    /// Position side implied by the fill direction ("long"/"short")
    position_side: String,
    total_qty: f64,
    weighted_price: f64,
    realized_pnl: f64,
    first_time_ms: i64,
    last_time_ms: i64,
}

/// Group fills by order id; a close group is one whose realized pnl is
/// non-zero. SELL fills close longs, BUY fills close shorts.
fn aggregate_close_groups(fills: &[AccountFill]) -> Vec<OrderGroup> {
    let mut groups: HashMap<i64, OrderGroup> = HashMap::new();

    for fill in fills {
        if fill.order_id == 0 || fill.symbol.is_empty() || fill.realized_pnl == 0.0 {
            continue;
        }
        let position_side = match fill.side.as_str() {
            "SELL" => "long",
            "BUY" => "short",
            _ => continue,
        };

        groups
            .entry(fill.order_id)
            .and_modify(|group| {
                let old_value = group.weighted_price * group.total_qty;
                group.total_qty += fill.qty;
                if group.total_qty > 0.0 {
                    group.weighted_price = (old_value + fill.price * fill.qty) / group.total_qty;
                }
                group.realized_pnl += fill.realized_pnl;
                group.first_time_ms = group.first_time_ms.min(fill.time_ms);
                group.last_time_ms = group.last_time_ms.max(fill.time_ms);
            })
            .or_insert_with(|| OrderGroup {
                order_id: fill.order_id,
                symbol: fill.symbol.clone(),
                position_side: position_side.to_string(),
                total_qty: fill.qty,
                weighted_price: fill.price,
                realized_pnl: fill.realized_pnl,
                first_time_ms: fill.time_ms,
                last_time_ms: fill.time_ms,
            });
    }

    groups.into_values().collect()
}

/// The matching open fill for a close group: opposite direction, zero
/// realized pnl, latest fill strictly before the close.
fn find_open_fill<'a>(fills: &'a [AccountFill], group: &OrderGroup) -> Option<&'a AccountFill> {
    let open_side = if group.position_side == "long" { "BUY" } else { "SELL" };

    fills
        .iter()
        .filter(|f| {
            f.symbol == group.symbol
                && f.side == open_side
                && f.realized_pnl == 0.0
                && f.time_ms < group.last_time_ms
        })
        .max_by_key(|f| f.time_ms)
}

impl AutoTrader {
    /// Back-fill trade rows for closes executed outside the agent
    pub(super) async fn sync_manual_trades(&self) -> Result<()> {
        let end = Utc::now().timestamp_millis();
        let start = end - 7 * 24 * 3600 * 1000;

        let fills = self
            .exchange
            .get_account_trades(None, start, end, 1000)
            .await
            .context("failed to fetch venue trade history")?;
        if fills.is_empty() {
            return Ok(());
        }

        let local_trades = self
            .storage
            .trades()
            .get_latest_trades(1000)
            .context("failed to load local trade history")?;
        let known_close_orders: HashSet<i64> = local_trades
            .iter()
            .filter(|t| t.close_order_id > 0)
            .map(|t| t.close_order_id)
            .collect();

        let mut synced = 0;
        for group in aggregate_close_groups(&fills) {
            if known_close_orders.contains(&group.order_id) {
                continue;
            }

            // Reconstruct the open side
            let mut open_price = 0.0;
            let mut open_quantity = 0.0;
            let mut open_order_id = 0i64;
            let mut open_time_ms = 0i64;

            if let Some(open_fill) = find_open_fill(&fills, &group) {
                open_price = open_fill.price;
                open_quantity = open_fill.qty;
                open_order_id = open_fill.order_id;
                open_time_ms = open_fill.time_ms;
            }

            // Fall back to the most recent local open before the close
            if open_price == 0.0 {
                if let Some(local) = local_trades
                    .iter()
                    .filter(|t| {
                        t.symbol == group.symbol
                            && t.side == group.position_side
                            && t.open_time.timestamp_millis() < group.last_time_ms
                    })
                    .max_by_key(|t| t.open_time)
                {
                    open_price = local.open_price;
                    open_quantity = local.open_quantity;
                    open_order_id = local.open_order_id;
                    open_time_ms = local.open_time.timestamp_millis();
                }
            }

            if open_price == 0.0 {
                logger::warning(
                    LogTag::Trader,
                    &format!(
                        "no open found for external close of {} {} (order {}), skipping",
                        group.symbol, group.position_side, group.order_id
                    ),
                );
                continue;
            }

            // Leverage recovery: live position, recent local trade, config
            let mut leverage = 0u32;
            if let Ok(positions) = self.exchange.get_positions().await {
                if let Some(position) = positions
                    .iter()
                    .find(|p| p.symbol == group.symbol && p.side == group.position_side)
                {
                    leverage = position.leverage;
                }
            }
            if leverage == 0 {
                if let Some(local) = local_trades.iter().find(|t| {
                    t.symbol == group.symbol
                        && t.side == group.position_side
                        && t.open_time.timestamp_millis() < group.last_time_ms
                        && t.open_time.timestamp_millis() > group.last_time_ms - 24 * 3600 * 1000
                }) {
                    leverage = local.open_leverage;
                }
            }
            if leverage == 0 {
                leverage = if group.symbol == "BTCUSDT" || group.symbol == "ETHUSDT" {
                    self.config.btc_eth_leverage
                } else {
                    self.config.altcoin_leverage
                };
                logger::warning(
                    LogTag::Trader,
                    &format!(
                        "leverage for external {} {} close unknown, using configured {}x",
                        group.symbol, group.position_side, leverage
                    ),
                );
            }

            let open_time = Utc
                .timestamp_millis_opt(open_time_ms)
                .single()
                .unwrap_or_else(Utc::now);
            let close_time = Utc
                .timestamp_millis_opt(group.last_time_ms)
                .single()
                .unwrap_or_else(Utc::now);

            let position_value = open_quantity * open_price;
            let margin_used = position_value / leverage as f64;
            let pnl_pct = if margin_used > 0.0 {
                group.realized_pnl / margin_used * 100.0
            } else {
                0.0
            };

            let duration = close_time - open_time;
            let trade = TradeRecord {
                trade_id: format!("{}_{}_{}", group.symbol, group.position_side, group.order_id),
                symbol: group.symbol.clone(),
                side: group.position_side.clone(),
                open_time,
                open_price,
                open_quantity,
                open_leverage: leverage,
                open_order_id,
                open_reason: "external open".to_string(),
                open_cycle_num: 0,
                position_value,
                margin_used,
                close_time: Some(close_time),
                close_price: group.weighted_price,
                close_quantity: group.total_qty,
                close_order_id: group.order_id,
                close_reason: "manual close".to_string(),
                close_cycle_num: self.call_count(),
                close_logic: "manual close".to_string(),
                duration: format!("{}m", duration.num_minutes().max(0)),
                pnl: group.realized_pnl,
                pnl_pct,
                success: true,
                ..Default::default()
            };

            match self.storage.trades().create_or_update_trade(&trade) {
                Ok(()) => {
                    synced += 1;
                    logger::info(
                        LogTag::Trader,
                        &format!(
                            "synced external close: {} {} pnl {:.2} USDT ({:.2}%)",
                            trade.symbol, trade.side, trade.pnl, trade.pnl_pct
                        ),
                    );
                }
                Err(e) => {
                    logger::warning(
                        LogTag::Storage,
                        &format!("failed to store synced trade {}: {}", trade.trade_id, e),
                    );
                }
            }
        }

        if synced > 0 {
            logger::info(
                LogTag::Trader,
                &format!("venue sync complete: {} external trades recorded", synced),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(order_id: i64, symbol: &str, side: &str, price: f64, qty: f64, pnl: f64, t: i64) -> AccountFill {
        AccountFill {
            order_id,
            symbol: symbol.to_string(),
            side: side.to_string(),
            price,
            qty,
            realized_pnl: pnl,
            time_ms: t,
        }
    }

    #[test]
    fn test_close_group_aggregation_weighted_price() {
        // Two SELL fills on the same order: qty 1 @ 2000 and qty 2 @ 2010
        let fills = vec![
            fill(111, "ETHUSDT", "SELL", 2_000.0, 1.0, 4.0, 1_000),
            fill(111, "ETHUSDT", "SELL", 2_010.0, 2.0, 8.34, 2_000),
        ];

        let groups = aggregate_close_groups(&fills);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.position_side, "long");
        assert!((group.total_qty - 3.0).abs() < 1e-9);
        // Weighted: (2000*1 + 2010*2) / 3 = 2006.666...
        assert!((group.weighted_price - 2_006.666_666_666_666_7).abs() < 1e-6);
        assert!((group.realized_pnl - 12.34).abs() < 1e-9);
        assert_eq!(group.last_time_ms, 2_000);
    }

    #[test]
    fn test_open_fills_are_not_close_groups() {
        let fills = vec![fill(100, "ETHUSDT", "BUY", 1_950.0, 3.0, 0.0, 500)];
        assert!(aggregate_close_groups(&fills).is_empty());
    }

    #[test]
    fn test_open_fill_matching() {
        let fills = vec![
            fill(100, "ETHUSDT", "BUY", 1_950.0, 3.0, 0.0, 500),
            fill(90, "ETHUSDT", "BUY", 1_900.0, 3.0, 0.0, 100),
            // Opposite symbol and late fill must not match
            fill(101, "BTCUSDT", "BUY", 60_000.0, 1.0, 0.0, 600),
            fill(102, "ETHUSDT", "BUY", 2_100.0, 3.0, 0.0, 5_000),
        ];
        let group = OrderGroup {
            order_id: 111,
            symbol: "ETHUSDT".to_string(),
            position_side: "long".to_string(),
            total_qty: 3.0,
            weighted_price: 2_006.67,
            realized_pnl: 12.34,
            first_time_ms: 1_000,
            last_time_ms: 2_000,
        };

        // Latest open before the close wins: order 100 at t=500
        let open = find_open_fill(&fills, &group).unwrap();
        assert_eq!(open.order_id, 100);
    }

    #[test]
    fn test_short_close_is_buy_side() {
        let fills = vec![fill(200, "SOLUSDT", "BUY", 150.0, 10.0, 25.0, 3_000)];
        let groups = aggregate_close_groups(&fills);
        assert_eq!(groups[0].position_side, "short");
    }
}
