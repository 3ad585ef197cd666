//! Decision execution
//!
//! One method per action. Every close path (AI-driven or forced) goes
//! through the per-position close lock and the forced-close registry; every
//! open re-validates margin and races against concurrent opens. Stop/take
//! intent is persisted locally before any exchange order is placed so a
//! venue failure never erases the model's price plan.

use super::constants::{
    MIN_POSITION_SIZE_USD, MIN_PRICE_UPDATE_RATIO, POST_CLOSE_GRACE, RESIDUAL_QUANTITY_EPSILON,
};
use super::engine::AutoTrader;
use super::guards::position_key;
use super::risk::check_margin_and_balance_safety;
use super::DecisionAction;
use crate::decision::logic::{extract_entry_logic, extract_exit_logic};
use crate::decision::{Context, Decision};
use crate::logger::{self, LogTag};
use crate::market;
use crate::storage::{StorageError, TradeRecord, TradeUpdate};
use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use chrono::Utc;

impl AutoTrader {
    /// Dispatch one validated decision
    pub(super) async fn execute_decision(
        &self,
        decision: &Decision,
        action: &mut DecisionAction,
    ) -> Result<()> {
        match decision.action.as_str() {
            "open_long" => self.execute_open(decision, action, "long").await,
            "open_short" => self.execute_open(decision, action, "short").await,
            "close_long" => self.execute_close(decision, action, "long").await,
            "close_short" => self.execute_close(decision, action, "short").await,
            "update_sl" => self.execute_update_stop_loss(decision, action).await,
            "update_tp" => self.execute_update_take_profit(decision, action).await,
            "hold" | "wait" => Ok(()),
            other => bail!("unknown action: {}", other),
        }
    }

    /// Open a position with the full pre-trade safety ladder
    async fn execute_open(
        &self,
        decision: &Decision,
        action: &mut DecisionAction,
        side: &str,
    ) -> Result<()> {
        logger::info(
            LogTag::Trader,
            &format!("opening {} {} ({:.0} USDT at {}x)", decision.symbol, side, decision.position_size_usd, decision.leverage),
        );

        // Same-side position guard: never stack onto an existing position
        if self.has_same_side_position(&decision.symbol, side).await? {
            bail!(
                "{} already has a {} position; close it first before re-opening",
                decision.symbol,
                side
            );
        }

        // Fresh context for the margin check
        let ctx = self
            .build_trading_context()
            .await
            .context("failed to rebuild context for margin check")?;

        let data = market::get(&decision.symbol).await?;
        if data.current_price <= 0.0 {
            bail!("current price is invalid: {:.4}", data.current_price);
        }

        check_margin_and_balance_safety(&ctx, decision, data.current_price)
            .context("margin safety check failed")?;

        // Race guard: re-check for a position created while we validated
        if self.has_same_side_position(&decision.symbol, side).await? {
            bail!(
                "position check failed: a {} position on {} appeared during validation",
                side,
                decision.symbol
            );
        }

        // Quantity: size / price, lot-rounded for submission
        let raw_quantity = decision.position_size_usd / data.current_price;
        let formatted = self
            .exchange
            .format_quantity(&decision.symbol, raw_quantity)
            .await
            .context("failed to format quantity")?;
        let quantity: f64 = formatted
            .parse()
            .map_err(|e| anyhow!("failed to parse formatted quantity '{}': {}", formatted, e))?;

        let min_quantity = MIN_POSITION_SIZE_USD / data.current_price;
        if quantity < min_quantity {
            bail!(
                "rounded quantity {:.8} is below the minimum {:.8} (position too small for this price)",
                quantity,
                min_quantity
            );
        }

        action.quantity = quantity;
        action.price = data.current_price;

        let order = if side == "long" {
            self.exchange
                .open_long(&decision.symbol, quantity, decision.leverage)
                .await?
        } else {
            self.exchange
                .open_short(&decision.symbol, quantity, decision.leverage)
                .await?
        };
        action.order_id = order.order_id;
        logger::info(
            LogTag::Trader,
            &format!("open filled: order {} qty {:.4}", order.order_id, quantity),
        );

        // Record the open time in memory and durably
        let first_seen_ms = Utc::now().timestamp_millis();
        self.record_first_seen(&decision.symbol, side, first_seen_ms);

        // Persist stop/take intent BEFORE placing exchange orders; a failed
        // trigger order must not lose the model's price plan
        if decision.stop_loss > 0.0 || decision.take_profit > 0.0 {
            if let Err(e) = self.logic_manager.save_stop_loss_and_take_profit(
                &decision.symbol,
                side,
                decision.stop_loss,
                decision.take_profit,
            ) {
                logger::warning(
                    LogTag::Storage,
                    &format!("failed to persist stop/take prices: {}", e),
                );
            }

            let exchange_side = if side == "long" { "LONG" } else { "SHORT" };
            if decision.stop_loss > 0.0 {
                if let Err(e) = self
                    .exchange
                    .set_stop_loss(&decision.symbol, exchange_side, quantity, decision.stop_loss)
                    .await
                {
                    logger::warning(
                        LogTag::Exchange,
                        &format!("stop-loss order failed (price kept locally): {}", e),
                    );
                }
            }
            if decision.take_profit > 0.0 {
                if let Err(e) = self
                    .exchange
                    .set_take_profit(&decision.symbol, exchange_side, quantity, decision.take_profit)
                    .await
                {
                    logger::warning(
                        LogTag::Exchange,
                        &format!("take-profit order failed (price kept locally): {}", e),
                    );
                }
            }
        }

        // Entry / exit reasoning
        let mut logic_ctx = Context {
            multi_timeframe_config: self.config.multi_timeframe.clone(),
            ..Default::default()
        };
        logic_ctx
            .market_data_map
            .insert(decision.symbol.clone(), data);

        if !decision.reasoning.is_empty() {
            let entry = extract_entry_logic(&decision.reasoning, &logic_ctx, &decision.symbol);
            if let Err(e) = self
                .logic_manager
                .save_entry_logic(&decision.symbol, side, &entry)
            {
                logger::warning(LogTag::Storage, &format!("failed to save entry logic: {}", e));
            }

            if !decision.exit_reasoning.is_empty() {
                let exit =
                    extract_exit_logic(&decision.exit_reasoning, &logic_ctx, &decision.symbol);
                if let Err(e) = self
                    .logic_manager
                    .save_exit_logic(&decision.symbol, side, &exit)
                {
                    logger::warning(LogTag::Storage, &format!("failed to save exit logic: {}", e));
                }
            } else {
                logger::warning(
                    LogTag::Trader,
                    &format!(
                        "{} {} opened without exit reasoning; the exit plan stays empty",
                        decision.symbol, side
                    ),
                );
            }
        }

        // Open-side trade row
        let trade = TradeRecord {
            trade_id: TradeRecord::make_trade_id(&decision.symbol, side, action.timestamp),
            symbol: decision.symbol.clone(),
            side: side.to_string(),
            open_time: action.timestamp,
            open_price: action.price,
            open_quantity: quantity,
            open_leverage: decision.leverage,
            open_order_id: order.order_id,
            open_reason: decision.reasoning.clone(),
            open_cycle_num: self.call_count(),
            position_value: quantity * action.price,
            margin_used: quantity * action.price / decision.leverage as f64,
            entry_logic: decision.reasoning.clone(),
            exit_logic: decision.exit_reasoning.clone(),
            success: true,
            ..Default::default()
        };
        if let Err(e) = self.storage.trades().create_trade(&trade) {
            logger::warning(LogTag::Storage, &format!("failed to create trade row: {}", e));
        }

        Ok(())
    }

    /// AI-driven close with lock + registry protection
    async fn execute_close(
        &self,
        decision: &Decision,
        action: &mut DecisionAction,
        side: &str,
    ) -> Result<()> {
        logger::info(LogTag::Trader, &format!("closing {} {}", decision.symbol, side));
        let key = position_key(&decision.symbol, side);

        // A live forced-close mark always skips the AI close
        if self.registry.has_mark(&key) {
            bail!(
                "position {} {} was force-closed already, skipping AI close",
                decision.symbol,
                side
            );
        }

        let lock = self.close_locks.lock_for(&key);
        let _guard = lock.lock().await;

        // Double-check under the lock
        if self.registry.has_mark(&key) {
            bail!(
                "position {} {} was force-closed already, skipping AI close",
                decision.symbol,
                side
            );
        }

        // The position's mark price is the close price estimate; fall back
        // to a market fetch when the venue no longer shows the position
        let held = self
            .exchange
            .get_positions()
            .await
            .ok()
            .and_then(|positions| {
                positions
                    .into_iter()
                    .find(|p| p.symbol == decision.symbol && p.side == side)
            });
        match &held {
            Some(position) => {
                action.price = position.mark_price;
                action.quantity = position.quantity();
            }
            None => {
                action.price = market::get(&decision.symbol).await?.current_price;
            }
        }

        let order = if side == "long" {
            self.exchange.close_long(&decision.symbol, 0.0).await?
        } else {
            self.exchange.close_short(&decision.symbol, 0.0).await?
        };
        // On failure the `?` above returns while the lock entry survives,
        // so retries for this position stay serialized.

        action.order_id = order.order_id;

        // Give the venue a moment, then warn if the position still shows
        tokio::time::sleep(POST_CLOSE_GRACE).await;
        if let Ok(positions) = self.exchange.get_positions().await {
            for position in positions {
                if position.symbol == decision.symbol
                    && position.side == side
                    && position.quantity() > RESIDUAL_QUANTITY_EPSILON
                {
                    logger::warning(
                        LogTag::Trader,
                        &format!(
                            "position still shows {:.8} after close; order may still be settling",
                            position.quantity()
                        ),
                    );
                    action.error = format!(
                        "position still open after close: {:.8} (may be settling)",
                        position.quantity()
                    );
                }
            }
        }

        self.close_locks.release(&key);
        self.clear_first_seen(&decision.symbol, side);

        // Keep the model's exit reasoning before dropping the logic row
        if !decision.reasoning.is_empty() {
            let mut logic_ctx = Context {
                multi_timeframe_config: self.config.multi_timeframe.clone(),
                ..Default::default()
            };
            // Trend capture needs market data only in multi-timeframe mode
            if self.config.multi_timeframe.is_some() {
                if let Ok(data) = market::get(&decision.symbol).await {
                    logic_ctx
                        .market_data_map
                        .insert(decision.symbol.clone(), data);
                }
            }
            let exit = extract_exit_logic(&decision.reasoning, &logic_ctx, &decision.symbol);
            if let Err(e) = self
                .logic_manager
                .save_exit_logic(&decision.symbol, side, &exit)
            {
                logger::warning(LogTag::Storage, &format!("failed to save exit logic: {}", e));
            }
        }

        if let Err(e) = self.logic_manager.delete_logic(&decision.symbol, side) {
            logger::warning(
                LogTag::Storage,
                &format!("failed to delete position logic: {}", e),
            );
        }

        let close_logic = if decision.reasoning.is_empty() {
            "closed by decision".to_string()
        } else {
            decision.reasoning.clone()
        };
        let close_action = DecisionAction {
            action: format!("close_{}", side),
            symbol: decision.symbol.clone(),
            quantity: action.quantity,
            leverage: decision.leverage,
            price: action.price,
            order_id: action.order_id,
            timestamp: Utc::now(),
            success: true,
            error: action.error.clone(),
            ..Default::default()
        };
        self.recorder
            .record_close(
                &decision.symbol,
                side,
                &close_action,
                None,
                self.call_count(),
                false,
                "",
                &close_logic,
            )
            .await;

        logger::info(LogTag::Trader, &format!("{} {} closed", decision.symbol, side));
        Ok(())
    }

    /// Force-close one position (watchdog or account-level risk halt).
    ///
    /// `price_hint` is the mark price the caller already holds; it avoids a
    /// market-data round trip on the hot safety path. A non-positive hint
    /// falls back to a fresh fetch.
    pub(super) async fn force_close_position(
        &self,
        symbol: &str,
        side: &str,
        reason: &str,
        price_hint: f64,
    ) -> Result<DecisionAction> {
        let key = position_key(symbol, side);

        // Fast path: skip when a live mark exists (expired marks clear here)
        if self.registry.is_blocked(&key) {
            bail!(
                "position {} {} is already marked force-closed, skipping",
                symbol,
                side
            );
        }

        let lock = self.close_locks.lock_for(&key);
        let _guard = lock.lock().await;

        // Double-check under the lock
        if self.registry.is_blocked(&key) {
            bail!(
                "position {} {} is already marked force-closed, skipping",
                symbol,
                side
            );
        }

        let mut action = DecisionAction {
            action: format!("close_{}", side),
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            is_forced: true,
            forced_reason: reason.to_string(),
            ..Default::default()
        };

        // Capture the open side before the position disappears
        let open_hint = self.exchange.get_positions().await.ok().and_then(|positions| {
            positions
                .iter()
                .find(|p| p.symbol == symbol && p.side == side)
                .map(|p| DecisionAction {
                    price: p.entry_price,
                    quantity: p.quantity(),
                    leverage: if p.leverage > 0 { p.leverage } else { 10 },
                    success: true,
                    ..Default::default()
                })
        });

        if price_hint > 0.0 {
            action.price = price_hint;
        } else {
            match market::get(symbol).await {
                Ok(data) => action.price = data.current_price,
                Err(e) => {
                    action.error = format!("failed to fetch market data: {}", e);
                    return Err(anyhow!("failed to fetch market data for {}: {}", symbol, e));
                }
            }
        }

        let result = if side == "long" {
            self.exchange.close_long(symbol, 0.0).await
        } else {
            self.exchange.close_short(symbol, 0.0).await
        };

        let order = match result {
            Ok(order) => order,
            Err(e) => {
                action.error = e.to_string();
                // Mark the failure so the next attempt honors the cool-down
                self.registry.mark(&key);
                logger::error(
                    LogTag::Watchdog,
                    &format!(
                        "forced close FAILED for {} {}: {} (retry allowed after cool-down, check the position manually)",
                        symbol, side, e
                    ),
                );
                return Err(e);
            }
        };

        action.order_id = order.order_id;
        action.success = true;

        self.registry.mark(&key);
        self.close_locks.release(&key);

        logger::info(
            LogTag::Watchdog,
            &format!("forced close filled: {} {} - {}", symbol, side, reason),
        );

        if let Err(e) = self.logic_manager.delete_logic(symbol, side) {
            logger::warning(
                LogTag::Storage,
                &format!("failed to delete position logic after forced close: {}", e),
            );
        }

        if let Some(hint) = &open_hint {
            action.quantity = hint.quantity;
            action.leverage = hint.leverage;
        }
        self.recorder
            .record_close(
                symbol,
                side,
                &action,
                open_hint.as_ref(),
                self.call_count(),
                true,
                reason,
                "",
            )
            .await;

        Ok(action)
    }

    /// update_sl: validate, trail-check, swap orders with rollback
    async fn execute_update_stop_loss(
        &self,
        decision: &Decision,
        action: &mut DecisionAction,
    ) -> Result<()> {
        logger::info(
            LogTag::Trader,
            &format!("updating stop loss: {} -> {:.4}", decision.symbol, decision.stop_loss),
        );
        if decision.stop_loss <= 0.0 {
            bail!("stop loss price must be greater than 0: {:.4}", decision.stop_loss);
        }

        let (position, side) = self.find_position_by_symbol(&decision.symbol).await?;
        let quantity = position.quantity();
        if quantity <= 0.0 {
            bail!("position quantity is invalid: {:.4}", quantity);
        }

        let stored = self.logic_manager.get_logic(&decision.symbol, &side);

        // No-op guard: tiny adjustments only churn orders
        if let Some(stored) = &stored {
            if stored.stop_loss > 0.0 {
                let diff = ((decision.stop_loss - stored.stop_loss) / stored.stop_loss).abs();
                if diff < MIN_PRICE_UPDATE_RATIO {
                    let reason = format!(
                        "new stop {:.4} differs from current {:.4} by {:.4}%, below the 0.5% threshold",
                        decision.stop_loss,
                        stored.stop_loss,
                        diff * 100.0
                    );
                    logger::info(LogTag::Trader, &format!("skipping stop update: {}", reason));
                    action.price = stored.stop_loss;
                    action.quantity = quantity;
                    action.error = format!("SKIPPED: {}", reason);
                    return Ok(());
                }
            }
        }

        let data = market::get(&decision.symbol).await?;
        if data.current_price <= 0.0 {
            bail!("current price for {} is invalid: {:.4}", decision.symbol, data.current_price);
        }
        let current_price = data.current_price;
        action.price = current_price;
        action.quantity = quantity;

        // Side-correct placement
        if side == "long" && decision.stop_loss >= current_price {
            bail!(
                "long stop loss {:.4} must be below the current price {:.4}",
                decision.stop_loss,
                current_price
            );
        }
        if side == "short" && decision.stop_loss <= current_price {
            bail!(
                "short stop loss {:.4} must be above the current price {:.4}",
                decision.stop_loss,
                current_price
            );
        }

        // Trailing rule: stops only move in the favorable direction
        if let Some(stored) = &stored {
            if stored.stop_loss > 0.0 {
                check_trailing_stop(&side, decision.stop_loss, stored.stop_loss)?;
            }
        }

        // Cross-validate against the supplied or preserved take profit
        if decision.take_profit > 0.0 {
            validate_exit_pair(&side, decision.stop_loss, decision.take_profit, current_price)?;
        }

        let preserve_take_profit = if decision.take_profit > 0.0 {
            decision.take_profit
        } else {
            stored.as_ref().map(|l| l.take_profit).unwrap_or(0.0)
        };
        let old_stop = stored.as_ref().map(|l| l.stop_loss).unwrap_or(0.0);
        let old_take = preserve_take_profit;

        self.swap_exit_orders(
            &decision.symbol,
            &side,
            quantity,
            ExitOrderPlan {
                primary_stop: Some(decision.stop_loss),
                primary_take: None,
                counter_take: (preserve_take_profit > 0.0).then_some(preserve_take_profit),
                counter_stop: None,
            },
            old_stop,
            old_take,
        )
        .await?;

        // Persist the final pair (0 preserves the other side)
        if let Err(e) = self.logic_manager.save_stop_loss_and_take_profit(
            &decision.symbol,
            &side,
            decision.stop_loss,
            preserve_take_profit,
        ) {
            logger::warning(LogTag::Storage, &format!("failed to persist stop/take: {}", e));
        }

        self.update_trade_logic_field(&decision.symbol, &side, true, &decision.reasoning);

        logger::info(
            LogTag::Trader,
            &format!("stop loss updated: {} {} -> {:.4}", decision.symbol, side, decision.stop_loss),
        );
        Ok(())
    }

    /// update_tp: validate and swap orders with rollback
    async fn execute_update_take_profit(
        &self,
        decision: &Decision,
        action: &mut DecisionAction,
    ) -> Result<()> {
        logger::info(
            LogTag::Trader,
            &format!("updating take profit: {} -> {:.4}", decision.symbol, decision.take_profit),
        );
        if decision.take_profit <= 0.0 {
            bail!("take profit price must be greater than 0: {:.4}", decision.take_profit);
        }

        let (position, side) = self.find_position_by_symbol(&decision.symbol).await?;
        let quantity = position.quantity();
        if quantity <= 0.0 {
            bail!("position quantity is invalid: {:.4}", quantity);
        }

        let stored = self.logic_manager.get_logic(&decision.symbol, &side);

        if let Some(stored) = &stored {
            if stored.take_profit > 0.0 {
                let diff = ((decision.take_profit - stored.take_profit) / stored.take_profit).abs();
                if diff < MIN_PRICE_UPDATE_RATIO {
                    let reason = format!(
                        "new take profit {:.4} differs from current {:.4} by {:.4}%, below the 0.5% threshold",
                        decision.take_profit,
                        stored.take_profit,
                        diff * 100.0
                    );
                    logger::info(LogTag::Trader, &format!("skipping take-profit update: {}", reason));
                    action.price = stored.take_profit;
                    action.quantity = quantity;
                    action.error = format!("SKIPPED: {}", reason);
                    return Ok(());
                }
            }
        }

        let data = market::get(&decision.symbol).await?;
        if data.current_price <= 0.0 {
            bail!("current price for {} is invalid: {:.4}", decision.symbol, data.current_price);
        }
        let current_price = data.current_price;
        action.price = current_price;
        action.quantity = quantity;

        if side == "long" && decision.take_profit <= current_price {
            bail!(
                "long take profit {:.4} must be above the current price {:.4}",
                decision.take_profit,
                current_price
            );
        }
        if side == "short" && decision.take_profit >= current_price {
            bail!(
                "short take profit {:.4} must be below the current price {:.4}",
                decision.take_profit,
                current_price
            );
        }

        if decision.stop_loss > 0.0 {
            validate_exit_pair(&side, decision.stop_loss, decision.take_profit, current_price)?;
        }

        let preserve_stop = if decision.stop_loss > 0.0 {
            decision.stop_loss
        } else {
            stored.as_ref().map(|l| l.stop_loss).unwrap_or(0.0)
        };
        let old_stop = preserve_stop;
        let old_take = stored.as_ref().map(|l| l.take_profit).unwrap_or(0.0);

        self.swap_exit_orders(
            &decision.symbol,
            &side,
            quantity,
            ExitOrderPlan {
                primary_stop: None,
                primary_take: Some(decision.take_profit),
                counter_take: None,
                counter_stop: (preserve_stop > 0.0).then_some(preserve_stop),
            },
            old_stop,
            old_take,
        )
        .await?;

        if let Err(e) = self.logic_manager.save_stop_loss_and_take_profit(
            &decision.symbol,
            &side,
            preserve_stop,
            decision.take_profit,
        ) {
            logger::warning(LogTag::Storage, &format!("failed to persist stop/take: {}", e));
        }

        self.update_trade_logic_field(&decision.symbol, &side, false, &decision.reasoning);

        logger::info(
            LogTag::Trader,
            &format!(
                "take profit updated: {} {} -> {:.4}",
                decision.symbol, side, decision.take_profit
            ),
        );
        Ok(())
    }

    /// Cancel old exit orders and place the new pair, rolling back the old
    /// orders best-effort if anything fails mid-swap.
    async fn swap_exit_orders(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        plan: ExitOrderPlan,
        old_stop: f64,
        old_take: f64,
    ) -> Result<()> {
        // Cancel the existing pair; "nothing to cancel" is success
        if let Err(e) = self.exchange.cancel_all_orders(symbol).await {
            if crate::exchange::is_no_orders_error(&e.to_string()) {
                logger::debug(LogTag::Exchange, "no existing orders to cancel");
            } else {
                return Err(e).context("failed to cancel existing exit orders");
            }
        }

        let exchange_side = if side == "long" { "LONG" } else { "SHORT" };

        // Primary order first
        let primary = if let Some(stop) = plan.primary_stop {
            self.exchange
                .set_stop_loss(symbol, exchange_side, quantity, stop)
                .await
        } else if let Some(take) = plan.primary_take {
            self.exchange
                .set_take_profit(symbol, exchange_side, quantity, take)
                .await
        } else {
            Ok(())
        };

        if let Err(e) = primary {
            self.rollback_exit_orders(symbol, exchange_side, quantity, old_stop, old_take)
                .await
                .map_err(|rollback| {
                    anyhow!(
                        "placing the new order failed ({}) and the rollback failed too ({}); manual intervention required",
                        e,
                        rollback
                    )
                })?;
            bail!("placing the new order failed ({}); old orders restored", e);
        }

        // Counter-order to keep the preserved side live
        let counter = if let Some(take) = plan.counter_take {
            self.exchange
                .set_take_profit(symbol, exchange_side, quantity, take)
                .await
        } else if let Some(stop) = plan.counter_stop {
            self.exchange
                .set_stop_loss(symbol, exchange_side, quantity, stop)
                .await
        } else {
            Ok(())
        };

        if let Err(e) = counter {
            self.rollback_exit_orders(symbol, exchange_side, quantity, old_stop, old_take)
                .await
                .map_err(|rollback| {
                    anyhow!(
                        "re-placing the counter order failed ({}) and the rollback failed too ({}); manual intervention required",
                        e,
                        rollback
                    )
                })?;
            bail!("re-placing the counter order failed ({}); old orders restored", e);
        }

        Ok(())
    }

    /// Best-effort restore of the previous stop/take pair
    async fn rollback_exit_orders(
        &self,
        symbol: &str,
        exchange_side: &str,
        quantity: f64,
        old_stop: f64,
        old_take: f64,
    ) -> Result<()> {
        let mut failures = Vec::new();

        if old_stop > 0.0 {
            if let Err(e) = self
                .exchange
                .set_stop_loss(symbol, exchange_side, quantity, old_stop)
                .await
            {
                failures.push(format!("stop loss restore failed: {}", e));
            }
        }
        if old_take > 0.0 {
            if let Err(e) = self
                .exchange
                .set_take_profit(symbol, exchange_side, quantity, old_take)
                .await
            {
                failures.push(format!("take profit restore failed: {}", e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{}", failures.join("; "))
        }
    }

    /// Reflect the update reasoning on the open trade row (warn if missing)
    fn update_trade_logic_field(&self, symbol: &str, side: &str, is_stop: bool, reasoning: &str) {
        if reasoning.is_empty() {
            return;
        }

        let open_time = {
            self.first_seen
                .read()
                .unwrap()
                .get(&position_key(symbol, side))
                .copied()
        };
        let Some(open_time_ms) = open_time else {
            logger::warning(
                LogTag::Trader,
                &format!("no open trade row found for {} {}; update logic not recorded", symbol, side),
            );
            return;
        };

        let Some(open_time) = chrono::TimeZone::timestamp_millis_opt(&Utc, open_time_ms).single()
        else {
            return;
        };

        let trade_id = TradeRecord::make_trade_id(symbol, side, open_time);
        let update = if is_stop {
            TradeUpdate {
                update_sl_logic: Some(reasoning.to_string()),
                ..Default::default()
            }
        } else {
            TradeUpdate {
                update_tp_logic: Some(reasoning.to_string()),
                ..Default::default()
            }
        };

        match self.storage.trades().update_trade(&trade_id, &update) {
            Ok(()) => {}
            Err(StorageError::NotFound) => {
                logger::warning(
                    LogTag::Trader,
                    &format!(
                        "trade row {} missing while recording update logic; proceeding",
                        trade_id
                    ),
                );
            }
            Err(e) => {
                logger::warning(
                    LogTag::Storage,
                    &format!("failed to record update logic on {}: {}", trade_id, e),
                );
            }
        }
    }

    /// The single position on a symbol, regardless of side
    async fn find_position_by_symbol(
        &self,
        symbol: &str,
    ) -> Result<(crate::exchange::ExchangePosition, String)> {
        let positions = self.exchange.get_positions().await?;
        positions
            .into_iter()
            .find(|p| p.symbol == symbol && p.quantity() > 0.0)
            .map(|p| {
                let side = p.side.clone();
                (p, side)
            })
            .ok_or_else(|| anyhow!("no position found for {}", symbol))
    }

    async fn has_same_side_position(&self, symbol: &str, side: &str) -> Result<bool> {
        let positions = self.exchange.get_positions().await?;
        Ok(positions
            .iter()
            .any(|p| p.symbol == symbol && p.side == side && p.quantity() > 0.0))
    }
}

struct ExitOrderPlan {
    primary_stop: Option<f64>,
    primary_take: Option<f64>,
    counter_take: Option<f64>,
    counter_stop: Option<f64>,
}

/// A stop loss may only trail in the favorable direction: up for longs,
/// down for shorts.
fn check_trailing_stop(side: &str, new_stop: f64, old_stop: f64) -> Result<()> {
    if side == "long" && new_stop < old_stop {
        bail!(
            "long stop may only move up: new {:.4} is below current {:.4}",
            new_stop,
            old_stop
        );
    }
    if side == "short" && new_stop > old_stop {
        bail!(
            "short stop may only move down: new {:.4} is above current {:.4}",
            new_stop,
            old_stop
        );
    }
    Ok(())
}

/// Stop/take relative ordering plus "price strictly between" check
fn validate_exit_pair(side: &str, stop_loss: f64, take_profit: f64, current_price: f64) -> Result<()> {
    if side == "long" {
        if stop_loss >= take_profit {
            bail!(
                "long stop {:.4} must be below take profit {:.4}",
                stop_loss,
                take_profit
            );
        }
        if stop_loss >= current_price || take_profit <= current_price {
            bail!(
                "current price {:.4} must sit between stop {:.4} and take profit {:.4}",
                current_price,
                stop_loss,
                take_profit
            );
        }
    } else {
        if stop_loss <= take_profit {
            bail!(
                "short stop {:.4} must be above take profit {:.4}",
                stop_loss,
                take_profit
            );
        }
        if take_profit >= current_price || stop_loss <= current_price {
            bail!(
                "current price {:.4} must sit between take profit {:.4} and stop {:.4}",
                current_price,
                take_profit,
                stop_loss
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_skip_threshold_boundary() {
        // 0.499% relative change skips, 0.501% executes
        assert!(0.004_99 < MIN_PRICE_UPDATE_RATIO);
        assert!(0.005_01 >= MIN_PRICE_UPDATE_RATIO);
    }

    #[test]
    fn test_trailing_stop_monotonicity() {
        // Long: moving up is fine, moving down is rejected
        check_trailing_stop("long", 58_500.0, 58_000.0).unwrap();
        check_trailing_stop("long", 58_000.0, 58_000.0).unwrap();
        assert!(check_trailing_stop("long", 57_500.0, 58_000.0).is_err());

        // Short: mirror image
        check_trailing_stop("short", 61_500.0, 62_000.0).unwrap();
        assert!(check_trailing_stop("short", 62_500.0, 62_000.0).is_err());
    }

    #[test]
    fn test_exit_pair_validation_long() {
        validate_exit_pair("long", 58_000.0, 62_000.0, 60_000.0).unwrap();
        assert!(validate_exit_pair("long", 62_000.0, 58_000.0, 60_000.0).is_err());
        // Price outside the band
        assert!(validate_exit_pair("long", 58_000.0, 62_000.0, 57_000.0).is_err());
        assert!(validate_exit_pair("long", 58_000.0, 62_000.0, 62_000.0).is_err());
    }

    #[test]
    fn test_exit_pair_validation_short() {
        validate_exit_pair("short", 62_000.0, 58_000.0, 60_000.0).unwrap();
        assert!(validate_exit_pair("short", 58_000.0, 62_000.0, 60_000.0).is_err());
        assert!(validate_exit_pair("short", 62_000.0, 58_000.0, 63_000.0).is_err());
    }
}
