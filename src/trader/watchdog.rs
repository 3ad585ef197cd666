//! Per-position stop-loss watchdog
//!
//! Runs every 10 seconds, independent of the LLM cycle, so a wick through
//! the stop level is acted on within seconds rather than minutes. Each
//! position's leveraged pnl% is checked against the configured stop-loss
//! (and optional take-profit) thresholds; breaches are closed at market.

use super::engine::{AutoTrader, CycleRecord};
use super::{AccountSnapshot, DecisionAction, PositionSnapshot};
use crate::logger::{self, LogTag};
use chrono::Utc;

impl AutoTrader {
    /// One watchdog tick. Never calls the model.
    pub(super) async fn check_position_stop_loss_only(&self) {
        if !self.is_running() {
            return;
        }

        let balance = match self.exchange.get_balance().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                logger::warning(
                    LogTag::Watchdog,
                    &format!("balance fetch failed during stop-loss check: {}", e),
                );
                None
            }
        };

        let positions = match self.exchange.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                logger::warning(
                    LogTag::Watchdog,
                    &format!("position fetch failed during stop-loss check: {}", e),
                );
                return;
            }
        };
        if positions.is_empty() {
            return;
        }

        // A zero config means "not set"; fall back to the 10% default
        let stop_loss_pct = if self.config.position_stop_loss_pct > 0.0 {
            self.config.position_stop_loss_pct
        } else {
            10.0
        };
        let take_profit_pct = self.config.position_take_profit_pct;

        let mut forced_actions: Vec<DecisionAction> = Vec::new();

        for position in &positions {
            if position.entry_price <= 0.0 {
                continue;
            }
            let leverage = if position.leverage > 0 { position.leverage } else { 10 };
            let direction = if position.side == "long" { 1.0 } else { -1.0 };
            let pnl_pct = direction * (position.mark_price - position.entry_price)
                / position.entry_price
                * leverage as f64
                * 100.0;

            if pnl_pct < 0.0 && -pnl_pct >= stop_loss_pct {
                let loss_pct = -pnl_pct;
                logger::warning(
                    LogTag::Watchdog,
                    &format!(
                        "forced stop loss: {} {} loss {:.2}% exceeds {:.2}%, closing at market",
                        position.symbol, position.side, loss_pct, stop_loss_pct
                    ),
                );

                let reason = format!(
                    "position loss {:.2}% exceeds {:.2}%",
                    loss_pct, stop_loss_pct
                );
                match self
                    .force_close_position(&position.symbol, &position.side, &reason, position.mark_price)
                    .await
                {
                    Ok(action) => {
                        self.clear_first_seen(&position.symbol, &position.side);
                        forced_actions.push(action);
                    }
                    Err(e) => {
                        logger::warning(
                            LogTag::Watchdog,
                            &format!(
                                "forced close failed ({} {}): {}",
                                position.symbol, position.side, e
                            ),
                        );
                        forced_actions.push(DecisionAction {
                            action: format!("close_{}", position.side),
                            symbol: position.symbol.clone(),
                            timestamp: Utc::now(),
                            is_forced: true,
                            forced_reason: reason,
                            error: e.to_string(),
                            ..Default::default()
                        });
                    }
                }
                continue;
            }

            if take_profit_pct > 0.0 && pnl_pct > 0.0 && pnl_pct >= take_profit_pct {
                logger::info(
                    LogTag::Watchdog,
                    &format!(
                        "forced take profit: {} {} gain {:.2}% reached {:.2}%, closing at market",
                        position.symbol, position.side, pnl_pct, take_profit_pct
                    ),
                );

                let reason = format!(
                    "position gain {:.2}% reached the {:.2}% take-profit target",
                    pnl_pct, take_profit_pct
                );
                match self
                    .force_close_position(&position.symbol, &position.side, &reason, position.mark_price)
                    .await
                {
                    Ok(action) => {
                        self.clear_first_seen(&position.symbol, &position.side);
                        forced_actions.push(action);
                    }
                    Err(e) => {
                        logger::warning(
                            LogTag::Watchdog,
                            &format!(
                                "forced close failed ({} {}): {}",
                                position.symbol, position.side, e
                            ),
                        );
                        forced_actions.push(DecisionAction {
                            action: format!("close_{}", position.side),
                            symbol: position.symbol.clone(),
                            timestamp: Utc::now(),
                            is_forced: true,
                            forced_reason: reason,
                            error: e.to_string(),
                            ..Default::default()
                        });
                    }
                }
            }
        }

        if forced_actions.is_empty() {
            return;
        }

        // Condensed audit record: cycle 0 marks watchdog interventions
        let mut record = CycleRecord::new(0, Utc::now());
        record.input_prompt =
            "[position stop-loss check] 10-second safety loop, market close on threshold breach"
                .to_string();

        if let Some(balance) = balance {
            let total_equity = balance.total_equity();
            record.account_state = AccountSnapshot {
                total_balance: total_equity,
                available_balance: balance.available_balance,
                total_unrealized_profit: total_equity - self.initial_balance(),
                position_count: positions.len(),
                margin_used_pct: 0.0,
            };
        }

        record.positions = positions
            .iter()
            .map(|p| PositionSnapshot {
                symbol: p.symbol.clone(),
                side: p.side.clone(),
                position_amt: p.quantity(),
                entry_price: p.entry_price,
                mark_price: p.mark_price,
                unrealized_profit: p.unrealized_profit,
                leverage: p.leverage as f64,
                liquidation_price: p.liquidation_price,
            })
            .collect();

        for action in &forced_actions {
            if action.success {
                record.execution_log.push(format!(
                    "forced close: {} {} - {}",
                    action.symbol, action.action, action.forced_reason
                ));
            } else {
                record.execution_log.push(format!(
                    "forced close FAILED: {} {} - {} ({})",
                    action.symbol, action.action, action.forced_reason, action.error
                ));
            }
        }
        record.decisions = forced_actions;

        self.persist_record(&record);
    }
}
