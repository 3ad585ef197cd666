//! End-to-end engine tests against a scripted exchange
//!
//! These cover the interplay between the watchdog, the forced-close
//! registry, the close locks, the recorder and the risk governor without
//! touching the network: the exchange is mocked and market-data calls are
//! avoided by keeping positions logic-free and multi-timeframe off.

use super::engine::{AutoTrader, AutoTraderConfig};
use super::guards::position_key;
use super::test_support::{position, MockExchange};
use crate::decision::Decision;
use crate::llm::LlmClient;
use crate::storage::StorageHub;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

static TEST_DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

fn test_data_dir() -> String {
    let n = TEST_DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir()
        .join(format!("perpbot-engine-test-{}-{}", std::process::id(), n))
        .to_string_lossy()
        .to_string()
}

fn test_config(id: &str) -> AutoTraderConfig {
    AutoTraderConfig {
        id: id.to_string(),
        name: format!("test-{}", id),
        ai_model: "deepseek".to_string(),
        exchange: "aster".to_string(),
        scan_interval: Duration::from_secs(180),
        initial_balance: 10_000.0,
        btc_eth_leverage: 10,
        altcoin_leverage: 5,
        max_daily_loss: 5.0,
        max_drawdown: 5.0,
        position_stop_loss_pct: 10.0,
        position_take_profit_pct: 0.0,
        stop_trading_time: Duration::from_secs(3_600),
        skip_liquidity_check: false,
        analysis_mode: "standard".to_string(),
        multi_timeframe: None,
        strategy_name: "sharpe_ratio".to_string(),
        strategy_preference: "balanced".to_string(),
    }
}

fn build_trader(id: &str, exchange: Arc<MockExchange>) -> Arc<AutoTrader> {
    let storage = Arc::new(StorageHub::new(&test_data_dir()).unwrap());
    let llm = LlmClient::deepseek("sk-test").unwrap();
    let trader = AutoTrader::new(test_config(id), exchange, llm, storage).unwrap();
    trader.set_running(true);
    trader
}

#[tokio::test]
async fn test_watchdog_forces_close_and_finalizes_trade() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(9_800.0, -200.0, 8_000.0);
    // Long from 60000 marked at 58900 with 10x: leveraged pnl is -18.33%
    exchange.set_positions(vec![position("BTCUSDT", "long", 60_000.0, 58_900.0, 0.1, 10)]);

    let trader = build_trader("watchdog", Arc::clone(&exchange));

    // Seed the open side the way a real open would have
    let open_time = Utc::now();
    trader.record_first_seen("BTCUSDT", "long", open_time.timestamp_millis());
    let open_row = crate::storage::TradeRecord {
        trade_id: crate::storage::TradeRecord::make_trade_id("BTCUSDT", "long", open_time),
        symbol: "BTCUSDT".to_string(),
        side: "long".to_string(),
        open_time,
        open_price: 60_000.0,
        open_quantity: 0.1,
        open_leverage: 10,
        open_reason: "breakout".to_string(),
        success: true,
        ..Default::default()
    };
    trader.storage.trades().create_trade(&open_row).unwrap();

    trader.check_position_stop_loss_only().await;

    // The position was closed at market
    assert_eq!(
        exchange.closed.lock().unwrap().as_slice(),
        &[("BTCUSDT".to_string(), "long".to_string())]
    );

    // The registry now blocks further close attempts
    assert!(trader.registry.has_mark(&position_key("BTCUSDT", "long")));

    // The trade row is finalized as forced with the loss in the reason
    let row = trader
        .storage
        .trades()
        .get_trade(&open_row.trade_id)
        .unwrap()
        .unwrap();
    assert!(row.close_time.is_some());
    assert!(row.is_forced);
    assert!(row.was_stop_loss);
    assert!(row.forced_close_logic.contains("18.33%"));
    assert!(row.forced_close_logic.contains("10.00%"));
    assert!(row.close_logic.is_empty());
    assert!(row.pnl < 0.0);

    // A condensed cycle-0 audit record exists
    let records = trader.get_decision_records(10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cycle_number, 0);

    // A subsequent AI close for the same position is skipped
    let close_decision = Decision {
        symbol: "BTCUSDT".to_string(),
        action: "close_long".to_string(),
        reasoning: "trend turned".to_string(),
        ..Default::default()
    };
    let mut action = super::DecisionAction::default();
    let err = trader
        .execute_decision(&close_decision, &mut action)
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("force-closed"));
}

#[tokio::test]
async fn test_watchdog_take_profit_threshold() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(10_500.0, 500.0, 9_000.0);
    // Long from 60000 marked at 60900 with 10x: +15% leveraged
    exchange.set_positions(vec![position("BTCUSDT", "long", 60_000.0, 60_900.0, 0.1, 10)]);

    // Take profit disabled: nothing happens
    let trader = build_trader("tp-disabled", Arc::clone(&exchange));
    trader.check_position_stop_loss_only().await;
    assert!(exchange.closed.lock().unwrap().is_empty());

    // Take profit at 10%: the 15% gain is closed
    let exchange2 = Arc::new(MockExchange::new());
    exchange2.set_balance(10_500.0, 500.0, 9_000.0);
    exchange2.set_positions(vec![position("BTCUSDT", "long", 60_000.0, 60_900.0, 0.1, 10)]);

    let storage = Arc::new(StorageHub::new(&test_data_dir()).unwrap());
    let llm = LlmClient::deepseek("sk-test").unwrap();
    let mut config = test_config("tp-enabled");
    config.position_take_profit_pct = 10.0;
    let trader2 = AutoTrader::new(
        config,
        Arc::clone(&exchange2) as Arc<dyn crate::exchange::ExchangeClient>,
        llm,
        storage,
    )
    .unwrap();
    trader2.set_running(true);

    trader2.check_position_stop_loss_only().await;
    assert_eq!(exchange2.closed.lock().unwrap().len(), 1);

    let row = trader2.storage.trades().get_latest_trades(1).unwrap();
    // Recovered via the position hint even without a pre-existing row
    assert_eq!(row.len(), 1);
    assert!(row[0].is_forced);
    assert!(!row[0].was_stop_loss); // profitable forced close is not a stop
}

#[tokio::test]
async fn test_ai_close_cleans_up_state() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(10_150.0, 150.0, 9_000.0);
    exchange.set_positions(vec![position("ETHUSDT", "short", 2_000.0, 1_950.0, 3.0, 5)]);

    let trader = build_trader("ai-close", Arc::clone(&exchange));

    let open_time = Utc::now();
    trader.record_first_seen("ETHUSDT", "short", open_time.timestamp_millis());
    trader
        .logic_manager
        .save_stop_loss_and_take_profit("ETHUSDT", "short", 2_100.0, 1_900.0)
        .unwrap();
    trader
        .storage
        .trades()
        .create_trade(&crate::storage::TradeRecord {
            trade_id: crate::storage::TradeRecord::make_trade_id("ETHUSDT", "short", open_time),
            symbol: "ETHUSDT".to_string(),
            side: "short".to_string(),
            open_time,
            open_price: 2_000.0,
            open_quantity: 3.0,
            open_leverage: 5,
            success: true,
            ..Default::default()
        })
        .unwrap();

    let decision = Decision {
        symbol: "ETHUSDT".to_string(),
        action: "close_short".to_string(),
        reasoning: "downside target reached".to_string(),
        ..Default::default()
    };
    let mut action = super::DecisionAction {
        action: "close_short".to_string(),
        symbol: "ETHUSDT".to_string(),
        timestamp: Utc::now(),
        ..Default::default()
    };
    trader.execute_decision(&decision, &mut action).await.unwrap();

    // Venue saw the close; local state is fully cleaned
    assert_eq!(exchange.closed.lock().unwrap().len(), 1);
    assert!(trader.logic_manager.get_logic("ETHUSDT", "short").is_none());
    assert!(trader
        .first_seen
        .read()
        .unwrap()
        .get(&position_key("ETHUSDT", "short"))
        .is_none());
    assert!(!trader.close_locks.contains(&position_key("ETHUSDT", "short")));

    // The trade row carries the AI's exit reasoning as close logic
    let rows = trader.storage.trades().get_latest_trades(1).unwrap();
    assert!(rows[0].close_time.is_some());
    assert_eq!(rows[0].close_logic, "downside target reached");
    assert!(rows[0].forced_close_logic.is_empty());
    assert!(!rows[0].is_forced);
    // Short closed lower than entry: profit
    assert!(rows[0].pnl > 0.0);
}

#[tokio::test]
async fn test_failed_close_keeps_lock_for_serialized_retry() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(10_000.0, 0.0, 9_000.0);
    exchange.set_positions(vec![position("BTCUSDT", "long", 60_000.0, 59_500.0, 0.1, 10)]);
    *exchange.fail_close.lock().unwrap() = true;

    let trader = build_trader("fail-close", Arc::clone(&exchange));

    let decision = Decision {
        symbol: "BTCUSDT".to_string(),
        action: "close_long".to_string(),
        ..Default::default()
    };
    let mut action = super::DecisionAction::default();
    assert!(trader.execute_decision(&decision, &mut action).await.is_err());

    // The per-position lock entry survives the failure
    assert!(trader.close_locks.contains(&position_key("BTCUSDT", "long")));
}

#[tokio::test]
async fn test_open_rejected_when_same_side_position_exists() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(10_000.0, 0.0, 9_000.0);
    exchange.set_positions(vec![position("BTCUSDT", "long", 60_000.0, 60_100.0, 0.1, 10)]);

    let trader = build_trader("same-side", Arc::clone(&exchange));

    let decision = Decision {
        symbol: "BTCUSDT".to_string(),
        action: "open_long".to_string(),
        leverage: 10,
        position_size_usd: 2_000.0,
        stop_loss: 58_000.0,
        take_profit: 62_000.0,
        ..Default::default()
    };
    let mut action = super::DecisionAction::default();
    let err = trader
        .execute_decision(&decision, &mut action)
        .await
        .unwrap_err()
        .to_string();
    assert!(err.contains("already has a long position"));
}

#[tokio::test]
async fn test_risk_pause_cycle_writes_failed_record() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(9_300.0, 0.0, 9_300.0);
    exchange.set_positions(vec![]);

    let trader = build_trader("risk-pause", Arc::clone(&exchange));

    // Equity 9300 against the 10000 peak is a 7% drawdown (limit 5%)
    let reason = trader.risk.check(9_300.0);
    assert!(reason.is_some());
    assert!(trader.risk.pause_remaining().is_some());

    // The next cycle observes the pause and records it without trading
    trader.run_cycle().await.unwrap();

    let records = trader.get_decision_records(5).unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(records[0].error_message.contains("risk pause"));
}

#[tokio::test]
async fn test_force_close_all_flattens_account() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(9_300.0, -700.0, 8_000.0);
    exchange.set_positions(vec![
        position("BTCUSDT", "long", 60_000.0, 59_000.0, 0.1, 10),
        position("ETHUSDT", "short", 2_000.0, 2_050.0, 2.0, 5),
    ]);

    let trader = build_trader("flatten", Arc::clone(&exchange));
    let ctx = trader.build_trading_context().await.unwrap();
    assert_eq!(ctx.positions.len(), 2);

    let actions = trader
        .force_close_all_positions("account drawdown breached the limit", &ctx)
        .await;

    assert_eq!(actions.len(), 2);
    assert!(actions.iter().all(|a| a.is_forced && a.success));
    assert_eq!(exchange.closed.lock().unwrap().len(), 2);
    assert!(trader.registry.has_mark(&position_key("BTCUSDT", "long")));
    assert!(trader.registry.has_mark(&position_key("ETHUSDT", "short")));
}

#[tokio::test]
async fn test_reconciler_backfills_external_close_idempotently() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(10_000.0, 0.0, 9_000.0);
    exchange.set_positions(vec![]);

    let now = Utc::now().timestamp_millis();
    *exchange.fills.lock().unwrap() = vec![
        // Open: order 100, BUY 3 @ 1950, no realized pnl
        crate::exchange::AccountFill {
            order_id: 100,
            symbol: "ETHUSDT".to_string(),
            side: "BUY".to_string(),
            price: 1_950.0,
            qty: 3.0,
            realized_pnl: 0.0,
            time_ms: now - 3_600_000,
        },
        // Close: order 111, two SELL fills, realized pnl +12.34 total
        crate::exchange::AccountFill {
            order_id: 111,
            symbol: "ETHUSDT".to_string(),
            side: "SELL".to_string(),
            price: 2_000.0,
            qty: 1.0,
            realized_pnl: 4.0,
            time_ms: now - 60_000,
        },
        crate::exchange::AccountFill {
            order_id: 111,
            symbol: "ETHUSDT".to_string(),
            side: "SELL".to_string(),
            price: 2_010.0,
            qty: 2.0,
            realized_pnl: 8.34,
            time_ms: now - 30_000,
        },
    ];

    let trader = build_trader("reconcile", Arc::clone(&exchange));
    trader.sync_manual_trades().await.unwrap();

    let trades = trader.storage.trades().get_latest_trades(10).unwrap();
    assert_eq!(trades.len(), 1);
    let trade = &trades[0];
    assert_eq!(trade.close_order_id, 111);
    assert_eq!(trade.open_order_id, 100);
    assert_eq!(trade.open_price, 1_950.0);
    assert!((trade.close_price - 2_006.666_666_666_666_7).abs() < 1e-6);
    assert!((trade.pnl - 12.34).abs() < 1e-9);
    assert_eq!(trade.open_reason, "external open");
    assert_eq!(trade.close_reason, "manual close");
    // No live position and no local history: configured major-pair leverage
    assert_eq!(trade.open_leverage, 10);

    // Running the sync again adds nothing
    trader.sync_manual_trades().await.unwrap();
    assert_eq!(trader.storage.trades().get_latest_trades(10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_build_context_recovers_first_seen_and_prunes_stale() {
    let exchange = Arc::new(MockExchange::new());
    exchange.set_balance(10_000.0, 0.0, 9_000.0);
    exchange.set_positions(vec![position("BTCUSDT", "long", 60_000.0, 60_500.0, 0.1, 10)]);

    let trader = build_trader("context", Arc::clone(&exchange));

    // Durable first-seen without the in-memory entry, as after a restart
    trader
        .logic_manager
        .save_first_seen_time("BTCUSDT", "long", 1_700_000_000_000)
        .unwrap();
    // Stale in-memory entry for a position that no longer exists
    trader
        .first_seen
        .write()
        .unwrap()
        .insert(position_key("SOLUSDT", "long"), 1_600_000_000_000);

    let ctx = trader.build_trading_context().await.unwrap();

    assert_eq!(ctx.positions.len(), 1);
    let pos = &ctx.positions[0];
    assert_eq!(pos.update_time, 1_700_000_000_000);
    // Leveraged pnl: (60500-60000)/60000 * 10 * 100 = 8.33%
    assert!((pos.unrealized_pnl_pct - 8.333_333_333_333_334).abs() < 1e-6);

    let first_seen = trader.first_seen.read().unwrap();
    assert!(first_seen.contains_key(&position_key("BTCUSDT", "long")));
    assert!(!first_seen.contains_key(&position_key("SOLUSDT", "long")));
}
