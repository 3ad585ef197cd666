//! AutoTrader: per-trader state and the LLM cycle runner
//!
//! One AutoTrader owns its exchange client, LLM client, storage handles and
//! risk state. `run()` drives two independent tickers: the AI decision cycle
//! at the configured scan interval and the fast stop-loss watchdog every
//! 10 seconds. Both loops observe the shutdown flag and the `is_running`
//! gate; in-flight work completes before the loops exit.

use super::constants::{INTER_DECISION_PAUSE, STOP_LOSS_CHECK_INTERVAL};
use super::guards::{position_key, CloseLockTable, ForcedCloseRegistry};
use super::performance::analyze_trades;
use super::recorder::TradeRecorder;
use super::risk::RiskGovernor;
use super::{AccountSnapshot, DecisionAction, PositionSnapshot};
use crate::config::MultiTimeframeConfig;
use crate::decision::{
    self,
    logic::check_logic_validity,
    AccountInfo, CandidateCoin, Context, PositionInfo,
};
use crate::exchange::ExchangeClient;
use crate::llm::LlmClient;
use crate::logger::{self, LogTag};
use crate::market;
use crate::pool;
use crate::shutdown;
use crate::storage::{PositionLogicManager, StorageHub, StoredDecisionRecord};
use anyhow::{Context as AnyhowContext, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Effective configuration for one trader instance
#[derive(Debug, Clone)]
pub struct AutoTraderConfig {
    pub id: String,
    pub name: String,
    pub ai_model: String,
    pub exchange: String,
    pub scan_interval: Duration,
    pub initial_balance: f64,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub position_stop_loss_pct: f64,
    pub position_take_profit_pct: f64,
    pub stop_trading_time: Duration,
    pub skip_liquidity_check: bool,
    pub analysis_mode: String,
    pub multi_timeframe: Option<MultiTimeframeConfig>,
    pub strategy_name: String,
    pub strategy_preference: String,
}

pub struct AutoTrader {
    pub(super) config: AutoTraderConfig,
    pub(super) exchange: Arc<dyn ExchangeClient>,
    pub(super) llm: LlmClient,
    pub(super) storage: Arc<StorageHub>,
    pub(super) logic_manager: Arc<PositionLogicManager>,
    pub(super) recorder: TradeRecorder,
    pub(super) risk: RiskGovernor,
    pub(super) registry: ForcedCloseRegistry,
    pub(super) close_locks: CloseLockTable,
    pub(super) first_seen: Arc<RwLock<HashMap<String, i64>>>,
    is_running: AtomicI32,
    call_count: AtomicI64,
    start_time: chrono::DateTime<Utc>,
}

impl AutoTrader {
    pub fn new(
        config: AutoTraderConfig,
        exchange: Arc<dyn ExchangeClient>,
        llm: LlmClient,
        storage: Arc<StorageHub>,
    ) -> Result<Arc<Self>> {
        anyhow::ensure!(
            config.initial_balance > 0.0,
            "initial balance must be greater than 0"
        );

        let logic_manager = Arc::new(PositionLogicManager::new(storage.position_logic()));

        // Recover first-seen timestamps persisted by earlier runs
        let first_seen: HashMap<String, i64> = logic_manager
            .get_all_first_seen_times()
            .unwrap_or_default();
        if !first_seen.is_empty() {
            logger::info(
                LogTag::Trader,
                &format!(
                    "recovered {} position open times from storage",
                    first_seen.len()
                ),
            );
        }
        let first_seen = Arc::new(RwLock::new(first_seen));

        let recorder = TradeRecorder::new(
            &config.id,
            storage.trades(),
            storage.decisions(),
            Arc::clone(&logic_manager),
            Arc::clone(&exchange),
            Arc::clone(&first_seen),
        );

        let risk = RiskGovernor::new(
            config.initial_balance,
            config.max_drawdown,
            config.max_daily_loss,
            config.stop_trading_time,
        );

        Ok(Arc::new(Self {
            config,
            exchange,
            llm,
            storage,
            logic_manager,
            recorder,
            risk,
            registry: ForcedCloseRegistry::new(),
            close_locks: CloseLockTable::new(),
            first_seen,
            is_running: AtomicI32::new(0),
            call_count: AtomicI64::new(0),
            start_time: Utc::now(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn ai_model(&self) -> &str {
        &self.config.ai_model
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst) == 1
    }

    pub fn call_count(&self) -> i64 {
        self.call_count.load(Ordering::SeqCst)
    }

    pub(super) fn set_running(&self, running: bool) {
        self.is_running.store(running as i32, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.set_running(false);
        logger::info(LogTag::Trader, &format!("[{}] trader stopped", self.config.name));
    }

    /// Main loop: AI decision cycle + independent stop-loss watchdog
    pub async fn run(self: Arc<Self>) {
        self.set_running(true);
        logger::info(
            LogTag::Trader,
            &format!(
                "🚀 [{}] trader started: balance {:.2} USDT, scan every {:?}",
                self.config.name, self.config.initial_balance, self.config.scan_interval
            ),
        );

        let mut scan_tick = tokio::time::interval(self.config.scan_interval);
        let mut watchdog_tick = tokio::time::interval(STOP_LOSS_CHECK_INTERVAL);
        scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        watchdog_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.is_running() && !shutdown::is_shutdown_requested() {
            tokio::select! {
                _ = scan_tick.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        logger::error(
                            LogTag::Trader,
                            &format!("[{}] cycle failed: {}", self.config.name, e),
                        );
                    }
                }
                _ = watchdog_tick.tick() => {
                    self.check_position_stop_loss_only().await;
                }
            }
        }

        logger::info(LogTag::Trader, &format!("[{}] run loop exited", self.config.name));
    }

    /// One tick of the LLM decision loop
    pub async fn run_cycle(&self) -> Result<()> {
        let cycle_num = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        logger::info(
            LogTag::Trader,
            &format!(
                "[{}] ===== decision cycle #{} at {} =====",
                self.config.name,
                cycle_num,
                now.format("%Y-%m-%d %H:%M:%S")
            ),
        );

        let mut record = CycleRecord::new(cycle_num, now);

        // 1. Risk pause gate
        if let Some(remaining) = self.risk.pause_remaining() {
            let minutes = remaining.as_secs() / 60;
            logger::info(
                LogTag::Risk,
                &format!("[{}] trading paused, {} minutes remaining", self.config.name, minutes),
            );
            record.success = false;
            record.error_message = format!("risk pause active, {} minutes remaining", minutes);

            // Best effort account snapshot so consumers still see state
            if let Ok(ctx) = self.build_trading_context().await {
                record.set_account(&ctx);
            }
            self.persist_record(&record);
            return Ok(());
        }

        // 2. Daily reset due?
        let reset_due = self.risk.daily_reset_due();

        // 3. Build trading context
        let mut ctx = match self.build_trading_context().await {
            Ok(ctx) => ctx,
            Err(e) => {
                if reset_due {
                    self.risk.daily_reset_fallback();
                }
                record.success = false;
                record.error_message = format!("failed to build trading context: {}", e);
                self.persist_record(&record);
                return Err(e).context("failed to build trading context");
            }
        };

        // Back-fill trades executed outside the agent before deciding
        if let Err(e) = self.sync_manual_trades().await {
            logger::warning(
                LogTag::Trader,
                &format!("[{}] venue trade sync failed: {}", self.config.name, e),
            );
        }

        // 4. Daily rollover with live equity
        if reset_due {
            self.risk.daily_reset(ctx.account.total_equity);
        }

        // 5. Clean stale forced-close marks
        let live_keys: HashSet<String> = ctx
            .positions
            .iter()
            .map(|p| position_key(&p.symbol, &p.side))
            .collect();
        self.registry.cleanup(&live_keys);

        // 6. Account-level risk check, force-closing everything on breach
        let forced_actions = self.check_account_risk(&ctx).await;
        for action in &forced_actions {
            record.execution_log.push(format!(
                "forced close: {} {} - {}",
                action.symbol, action.action, action.forced_reason
            ));
            if let Some(side) = action.action.strip_prefix("close_") {
                self.clear_first_seen(&action.symbol, side);
            }
            record.decisions.push(action.clone());
        }

        // 7. Rebuild context after forced closes so the model sees reality
        if !forced_actions.is_empty() {
            match self.build_trading_context().await {
                Ok(rebuilt) => ctx = rebuilt,
                Err(e) => logger::warning(
                    LogTag::Trader,
                    &format!(
                        "[{}] context rebuild after forced closes failed: {}",
                        self.config.name, e
                    ),
                ),
            }
        }

        record.set_account(&ctx);
        record.set_positions(&ctx);
        record.candidate_coins = ctx.candidate_coins.iter().map(|c| c.symbol.clone()).collect();

        logger::info(
            LogTag::Trader,
            &format!(
                "[{}] equity {:.2} USDT | available {:.2} | {} positions",
                self.config.name,
                ctx.account.total_equity,
                ctx.account.available_balance,
                ctx.account.position_count
            ),
        );

        // 8. Ask the model
        let full_decision = match decision::get_full_decision(&mut ctx, &self.llm).await {
            Ok(full) => full,
            Err(e) => {
                record.success = false;
                record.error_message = format!("LLM decision failed: {}", e);
                self.persist_record(&record);
                return Err(e).context("LLM decision failed");
            }
        };

        record.input_prompt = full_decision.user_prompt.clone();
        record.cot_trace = full_decision.cot_trace.clone();
        if !full_decision.decisions.is_empty() {
            record.decision_json =
                serde_json::to_string_pretty(&full_decision.decisions).unwrap_or_default();
        }

        logger::info(
            LogTag::Ai,
            &format!(
                "[{}] model returned {} decisions",
                self.config.name,
                full_decision.decisions.len()
            ),
        );
        for (i, d) in full_decision.decisions.iter().enumerate() {
            logger::info(
                LogTag::Ai,
                &format!("  [{}] {} {} - {}", i + 1, d.symbol, d.action, d.reasoning),
            );
        }

        // 9. Order and dedupe: closes first, one update_sl/update_tp per symbol
        let sorted = decision::engine::sort_decisions_by_priority(full_decision.decisions);
        let before = sorted.len();
        let decisions = decision::engine::deduplicate_decisions(sorted);
        if decisions.len() < before {
            logger::info(
                LogTag::Trader,
                &format!(
                    "[{}] decision dedupe: {} -> {}",
                    self.config.name,
                    before,
                    decisions.len()
                ),
            );
        }

        // 10. Execute
        for d in &decisions {
            // Honor forced-close marks (cool-down aware)
            if let Some(side) = d.action.strip_prefix("close_") {
                let key = position_key(&d.symbol, side);
                if self.registry.is_blocked(&key) {
                    logger::info(
                        LogTag::Trader,
                        &format!("skipping {} {} (already force-closed)", d.symbol, d.action),
                    );
                    record
                        .execution_log
                        .push(format!("skipped {} {} (already force-closed)", d.symbol, d.action));
                    continue;
                }
            }

            let mut action = DecisionAction {
                action: d.action.clone(),
                symbol: d.symbol.clone(),
                leverage: d.leverage,
                timestamp: Utc::now(),
                ..Default::default()
            };

            match self.execute_decision(d, &mut action).await {
                Ok(()) => {
                    action.success = true;
                    if action.was_skipped() {
                        record.execution_log.push(format!(
                            "{} {} skipped: {}",
                            d.symbol,
                            d.action,
                            action.error.trim_start_matches("SKIPPED: ")
                        ));
                    } else {
                        record
                            .execution_log
                            .push(format!("{} {} succeeded", d.symbol, d.action));
                        tokio::time::sleep(INTER_DECISION_PAUSE).await;
                    }
                }
                Err(e) => {
                    logger::error(
                        LogTag::Trader,
                        &format!("decision failed ({} {}): {}", d.symbol, d.action, e),
                    );
                    action.error = e.to_string();
                    record
                        .execution_log
                        .push(format!("{} {} failed: {}", d.symbol, d.action, e));
                    if d.is_close() {
                        record.execution_log.push(format!(
                            "warning: {} {} close failed, position may remain open",
                            d.symbol, d.action
                        ));
                    }
                }
            }

            record.decisions.push(action);
        }

        // 11. Persist record + snapshot
        self.persist_record(&record);
        self.log_cycle_snapshot(&ctx, &record, cycle_num);

        Ok(())
    }

    /// Account-level drawdown / daily-loss check; flattens on breach
    async fn check_account_risk(&self, ctx: &Context) -> Vec<DecisionAction> {
        let Some(reason) = self.risk.check(ctx.account.total_equity) else {
            return Vec::new();
        };

        let description = reason.describe();
        logger::error(
            LogTag::Risk,
            &format!(
                "[{}] account risk halt: {} - closing all positions, pausing {:?}",
                self.config.name, description, self.config.stop_trading_time
            ),
        );

        self.force_close_all_positions(&description, ctx).await
    }

    /// Force-close every open position (account-level halt)
    pub(super) async fn force_close_all_positions(
        &self,
        reason: &str,
        ctx: &Context,
    ) -> Vec<DecisionAction> {
        let mut actions = Vec::new();
        for position in &ctx.positions {
            match self
                .force_close_position(&position.symbol, &position.side, reason, position.mark_price)
                .await
            {
                Ok(action) => actions.push(action),
                Err(e) => {
                    logger::error(
                        LogTag::Trader,
                        &format!(
                            "forced close failed ({} {}): {}",
                            position.symbol, position.side, e
                        ),
                    );
                }
            }
        }
        actions
    }

    /// Assemble the full trading context for one cycle
    pub async fn build_trading_context(&self) -> Result<Context> {
        let balance = self
            .exchange
            .get_balance()
            .await
            .context("failed to fetch account balance")?;
        let total_equity = balance.total_equity();

        let positions = self
            .exchange
            .get_positions()
            .await
            .context("failed to fetch positions")?;

        let mut position_infos = Vec::with_capacity(positions.len());
        let mut total_margin_used = 0.0;
        let mut live_keys = HashSet::new();

        for position in &positions {
            let quantity = position.quantity();
            let leverage = if position.leverage > 0 { position.leverage } else { 10 };
            let margin_used = quantity * position.mark_price / leverage as f64;
            total_margin_used += margin_used;

            let pnl_pct = if position.entry_price > 0.0 {
                let direction = if position.side == "long" { 1.0 } else { -1.0 };
                direction * (position.mark_price - position.entry_price) / position.entry_price
                    * leverage as f64
                    * 100.0
            } else {
                0.0
            };

            let key = position_key(&position.symbol, &position.side);
            live_keys.insert(key.clone());

            // First-seen: memory first, then the durable store
            let mut update_time = { self.first_seen.read().unwrap().get(&key).copied() };
            if update_time.is_none() {
                if let Some(stored) =
                    self.logic_manager.get_first_seen_time(&position.symbol, &position.side)
                {
                    self.first_seen.write().unwrap().insert(key.clone(), stored);
                    update_time = Some(stored);
                    logger::debug(
                        LogTag::Trader,
                        &format!(
                            "recovered open time for {} {} from storage",
                            position.symbol, position.side
                        ),
                    );
                }
            }

            let logic = self.logic_manager.get_logic(&position.symbol, &position.side);
            let (mut logic_invalid, mut invalid_reasons) = (false, Vec::new());
            // The validity check only looks at recorded entry/exit logic, so
            // a bare stop/take row does not warrant a market-data fetch
            let has_logic_content = logic
                .as_ref()
                .map(|l| l.entry_logic.is_some() || l.exit_logic.is_some())
                .unwrap_or(false);
            if has_logic_content {
                if let Ok(data) = market::get(&position.symbol).await {
                    let (invalid, reasons) =
                        check_logic_validity(logic.as_ref(), &data, &position.side);
                    logic_invalid = invalid;
                    invalid_reasons = reasons;
                }
            }

            let (stop_loss, take_profit, entry_logic, exit_logic) = match &logic {
                Some(l) => (
                    l.stop_loss,
                    l.take_profit,
                    l.entry_logic.clone(),
                    l.exit_logic.clone(),
                ),
                None => (0.0, 0.0, None, None),
            };

            position_infos.push(PositionInfo {
                symbol: position.symbol.clone(),
                side: position.side.clone(),
                entry_price: position.entry_price,
                mark_price: position.mark_price,
                quantity,
                leverage,
                unrealized_pnl: position.unrealized_profit,
                unrealized_pnl_pct: pnl_pct,
                liquidation_price: position.liquidation_price,
                margin_used,
                update_time: update_time.unwrap_or(0),
                stop_loss,
                take_profit,
                entry_logic,
                exit_logic,
                logic_invalid,
                invalid_reasons,
            });
        }

        // Drop first-seen entries for positions that no longer exist
        {
            let mut first_seen = self.first_seen.write().unwrap();
            first_seen.retain(|key, _| live_keys.contains(key));
        }

        // Candidate pool
        const COIN_LIMIT: usize = 20;
        let merged = pool::get_merged_coin_pool(COIN_LIMIT).context("failed to build coin pool")?;
        let candidate_coins: Vec<CandidateCoin> = merged
            .all_symbols
            .iter()
            .map(|symbol| CandidateCoin {
                symbol: symbol.clone(),
                sources: merged
                    .symbol_sources
                    .get(symbol)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();

        let total_pnl = total_equity - self.config.initial_balance;
        let total_pnl_pct = if self.config.initial_balance > 0.0 {
            total_pnl / self.config.initial_balance * 100.0
        } else {
            0.0
        };
        let margin_used_pct = if total_equity > 0.0 {
            total_margin_used / total_equity * 100.0
        } else {
            0.0
        };

        // Historical performance for the prompt
        let performance = self
            .storage
            .trades()
            .get_latest_trades(200)
            .ok()
            .map(|trades| analyze_trades(&trades));

        let recent_forced_closes = self
            .storage
            .decisions()
            .get_forced_closes(&self.config.id, 3)
            .unwrap_or_default();

        Ok(Context {
            current_time: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            runtime_minutes: (Utc::now() - self.start_time).num_minutes(),
            call_count: self.call_count(),
            account: AccountInfo {
                total_equity,
                available_balance: balance.available_balance,
                total_pnl,
                total_pnl_pct,
                margin_used: total_margin_used,
                margin_used_pct,
                position_count: position_infos.len(),
            },
            positions: position_infos,
            candidate_coins,
            market_data_map: HashMap::new(),
            performance,
            recent_forced_closes,
            btc_eth_leverage: self.config.btc_eth_leverage,
            altcoin_leverage: self.config.altcoin_leverage,
            skip_liquidity_check: self.config.skip_liquidity_check,
            analysis_mode: self.config.analysis_mode.clone(),
            multi_timeframe_config: self.config.multi_timeframe.clone(),
            strategy_name: self.config.strategy_name.clone(),
            strategy_preference: self.config.strategy_preference.clone(),
        })
    }

    pub(super) fn clear_first_seen(&self, symbol: &str, side: &str) {
        self.first_seen
            .write()
            .unwrap()
            .remove(&position_key(symbol, side));
    }

    pub(super) fn record_first_seen(&self, symbol: &str, side: &str, first_seen_ms: i64) {
        self.first_seen
            .write()
            .unwrap()
            .insert(position_key(symbol, side), first_seen_ms);
        if let Err(e) = self
            .logic_manager
            .save_first_seen_time(symbol, side, first_seen_ms)
        {
            logger::warning(
                LogTag::Storage,
                &format!("failed to persist first-seen time for {} {}: {}", symbol, side, e),
            );
        }
    }

    pub(super) fn persist_record(&self, record: &CycleRecord) {
        let stored = record.to_stored();
        if let Err(e) = self.storage.decisions().log_decision(&self.config.id, &stored) {
            logger::warning(
                LogTag::Storage,
                &format!("[{}] failed to persist decision record: {}", self.config.name, e),
            );
        }
    }

    fn log_cycle_snapshot(&self, ctx: &Context, record: &CycleRecord, cycle_num: i64) {
        let snapshot = serde_json::json!({
            "trader_id": self.config.id,
            "cycle_number": cycle_num,
            "timestamp": record.timestamp.timestamp_millis(),
            "scan_interval_secs": self.config.scan_interval.as_secs(),
            "account_state": {
                "total_equity": ctx.account.total_equity,
                "available_balance": ctx.account.available_balance,
                "total_pnl": ctx.account.total_pnl,
                "margin_used_pct": ctx.account.margin_used_pct,
            },
            "market_environment": {
                "candidate_count": ctx.candidate_coins.len(),
                "analysis_mode": ctx.analysis_mode,
            },
            "positions_snapshot": record.positions,
            "ai_decision": {
                "cot_trace": record.cot_trace,
                "decision_json": record.decision_json,
            },
            "execution_result": {
                "log": record.execution_log,
                "success": record.success,
                "error": record.error_message,
            },
            "system_metrics": {
                "call_count": self.call_count(),
                "runtime_minutes": (Utc::now() - self.start_time).num_minutes(),
                "daily_pnl": self.risk.daily_pnl(),
                "peak_equity": self.risk.peak_equity(),
            },
        });

        if let Err(e) = self
            .storage
            .snapshots()
            .log_snapshot(&self.config.id, cycle_num, &snapshot)
        {
            logger::warning(
                LogTag::Storage,
                &format!("[{}] failed to persist cycle snapshot: {}", self.config.name, e),
            );
        }
    }

    // ------------------------------------------------------------------
    // Read API accessors
    // ------------------------------------------------------------------

    pub fn get_status(&self) -> serde_json::Value {
        serde_json::json!({
            "trader_id": self.config.id,
            "trader_name": self.config.name,
            "ai_model": self.config.ai_model,
            "exchange": self.config.exchange,
            "is_running": self.is_running(),
            "start_time": self.start_time.to_rfc3339(),
            "runtime_minutes": (Utc::now() - self.start_time).num_minutes(),
            "call_count": self.call_count(),
            "initial_balance": self.config.initial_balance,
            "scan_interval_secs": self.config.scan_interval.as_secs(),
            "stop_until": self.risk.paused_until().map(|t| t.to_rfc3339()),
            "last_reset_time": self.risk.last_reset_time().to_rfc3339(),
        })
    }

    pub async fn get_account_info(&self) -> Result<serde_json::Value> {
        let balance = self.exchange.get_balance().await?;
        let positions = self.exchange.get_positions().await?;

        let total_equity = balance.total_equity();
        let mut total_margin_used = 0.0;
        let mut total_unrealized = 0.0;
        for position in &positions {
            let leverage = if position.leverage > 0 { position.leverage } else { 10 };
            total_margin_used += position.quantity() * position.mark_price / leverage as f64;
            total_unrealized += position.unrealized_profit;
        }

        let total_pnl = total_equity - self.config.initial_balance;
        let total_pnl_pct = if self.config.initial_balance > 0.0 {
            total_pnl / self.config.initial_balance * 100.0
        } else {
            0.0
        };
        let margin_used_pct = if total_equity > 0.0 {
            total_margin_used / total_equity * 100.0
        } else {
            0.0
        };

        Ok(serde_json::json!({
            "total_equity": total_equity,
            "wallet_balance": balance.total_wallet_balance,
            "unrealized_profit": balance.total_unrealized_profit,
            "available_balance": balance.available_balance,
            "total_pnl": total_pnl,
            "total_pnl_pct": total_pnl_pct,
            "total_unrealized_pnl": total_unrealized,
            "initial_balance": self.config.initial_balance,
            "daily_pnl": self.risk.daily_pnl(),
            "position_count": positions.len(),
            "margin_used": total_margin_used,
            "margin_used_pct": margin_used_pct,
        }))
    }

    pub async fn get_positions_view(&self) -> Result<Vec<serde_json::Value>> {
        let positions = self.exchange.get_positions().await?;

        let mut result = Vec::with_capacity(positions.len());
        for position in &positions {
            let quantity = position.quantity();
            let leverage = if position.leverage > 0 { position.leverage } else { 10 };
            let direction = if position.side == "long" { 1.0 } else { -1.0 };
            let pnl_pct = if position.entry_price > 0.0 {
                direction * (position.mark_price - position.entry_price) / position.entry_price
                    * leverage as f64
                    * 100.0
            } else {
                0.0
            };

            let logic = self.logic_manager.get_logic(&position.symbol, &position.side);
            let mut view = serde_json::json!({
                "symbol": position.symbol,
                "side": position.side,
                "entry_price": position.entry_price,
                "mark_price": position.mark_price,
                "quantity": quantity,
                "leverage": leverage,
                "unrealized_pnl": position.unrealized_profit,
                "unrealized_pnl_pct": pnl_pct,
                "liquidation_price": position.liquidation_price,
                "margin_used": quantity * position.mark_price / leverage as f64,
            });

            if let Some(logic) = &logic {
                if let Some(entry) = &logic.entry_logic {
                    view["entry_logic"] = serde_json::to_value(entry).unwrap_or_default();
                }
                if let Some(exit) = &logic.exit_logic {
                    view["exit_logic"] = serde_json::to_value(exit).unwrap_or_default();
                }
                if let Ok(data) = market::get(&position.symbol).await {
                    let (invalid, reasons) =
                        check_logic_validity(Some(logic), &data, &position.side);
                    if invalid {
                        view["logic_invalid"] = serde_json::Value::Bool(true);
                        view["invalid_reasons"] = serde_json::to_value(reasons).unwrap_or_default();
                    }
                }
            }

            result.push(view);
        }
        Ok(result)
    }

    pub fn get_decision_records(&self, limit: usize) -> Result<Vec<StoredDecisionRecord>> {
        Ok(self.storage.decisions().get_latest_records(&self.config.id, limit)?)
    }

    /// Full performance analysis, cached for a minute because it scans the
    /// whole trade history
    pub fn get_performance(&self) -> Result<super::performance::PerformanceAnalysis> {
        let cache_key = format!("performance:{}", self.config.id);
        if let Some(cached) = self.storage.cache().get(&cache_key) {
            if let Ok(analysis) = serde_json::from_value(cached) {
                return Ok(analysis);
            }
        }

        let trades = self.storage.trades().get_latest_trades(10_000)?;
        let analysis = analyze_trades(&trades);

        if let Ok(value) = serde_json::to_value(&analysis) {
            if let Err(e) = self
                .storage
                .cache()
                .set(&cache_key, &value, Duration::from_secs(60))
            {
                logger::debug(
                    LogTag::Storage,
                    &format!("failed to cache performance analysis: {}", e),
                );
            }
        }
        Ok(analysis)
    }

    pub fn initial_balance(&self) -> f64 {
        self.config.initial_balance
    }
}

/// In-flight cycle record, persisted at the end of the cycle
pub(super) struct CycleRecord {
    pub cycle_number: i64,
    pub timestamp: chrono::DateTime<Utc>,
    pub input_prompt: String,
    pub cot_trace: String,
    pub decision_json: String,
    pub account_state: AccountSnapshot,
    pub positions: Vec<PositionSnapshot>,
    pub candidate_coins: Vec<String>,
    pub decisions: Vec<DecisionAction>,
    pub execution_log: Vec<String>,
    pub success: bool,
    pub error_message: String,
}

impl CycleRecord {
    pub fn new(cycle_number: i64, timestamp: chrono::DateTime<Utc>) -> Self {
        Self {
            cycle_number,
            timestamp,
            input_prompt: String::new(),
            cot_trace: String::new(),
            decision_json: String::new(),
            account_state: AccountSnapshot::default(),
            positions: Vec::new(),
            candidate_coins: Vec::new(),
            decisions: Vec::new(),
            execution_log: Vec::new(),
            success: true,
            error_message: String::new(),
        }
    }

    pub fn set_account(&mut self, ctx: &Context) {
        self.account_state = AccountSnapshot {
            total_balance: ctx.account.total_equity,
            available_balance: ctx.account.available_balance,
            total_unrealized_profit: ctx.account.total_pnl,
            position_count: ctx.account.position_count,
            margin_used_pct: ctx.account.margin_used_pct,
        };
    }

    pub fn set_positions(&mut self, ctx: &Context) {
        self.positions = ctx
            .positions
            .iter()
            .map(|p| PositionSnapshot {
                symbol: p.symbol.clone(),
                side: p.side.clone(),
                position_amt: p.quantity,
                entry_price: p.entry_price,
                mark_price: p.mark_price,
                unrealized_profit: p.unrealized_pnl,
                leverage: p.leverage as f64,
                liquidation_price: p.liquidation_price,
            })
            .collect();
    }

    pub fn to_stored(&self) -> StoredDecisionRecord {
        StoredDecisionRecord {
            cycle_number: self.cycle_number,
            timestamp: self.timestamp,
            input_prompt: self.input_prompt.clone(),
            cot_trace: self.cot_trace.clone(),
            decision_json: self.decision_json.clone(),
            account_state: serde_json::to_value(&self.account_state)
                .unwrap_or(serde_json::Value::Null),
            positions: serde_json::to_value(&self.positions).unwrap_or(serde_json::Value::Null),
            candidate_coins: serde_json::to_value(&self.candidate_coins)
                .unwrap_or(serde_json::Value::Null),
            decisions: serde_json::to_value(&self.decisions).unwrap_or(serde_json::Value::Null),
            execution_log: serde_json::to_value(&self.execution_log)
                .unwrap_or(serde_json::Value::Null),
            success: self.success,
            error_message: self.error_message.clone(),
        }
    }
}
