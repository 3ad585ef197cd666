//! Trader engine
//!
//! The long-running heart of the agent: the per-trader cycle runner, the
//! decision executor, the independent stop-loss watchdog, the account-level
//! risk governor, trade-history recording and venue reconciliation.

pub mod constants;
pub mod engine;
#[cfg(test)]
mod engine_tests;
pub mod executor;
pub mod guards;
pub mod manager;
pub mod performance;
pub mod reconciler;
pub mod recorder;
pub mod retry;
pub mod risk;
pub mod watchdog;

pub use engine::{AutoTrader, AutoTraderConfig};
pub use manager::TraderManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One executed (or attempted) action inside a cycle record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionAction {
    pub action: String,
    pub symbol: String,
    pub quantity: f64,
    pub leverage: u32,
    pub price: f64,
    pub order_id: i64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: String,
    pub is_forced: bool,
    pub forced_reason: String,
}

impl DecisionAction {
    pub fn was_skipped(&self) -> bool {
        self.error.starts_with("SKIPPED:")
    }
}

/// Account snapshot embedded in decision records.
///
/// Field naming is kept stable for API consumers: `total_balance` carries
/// the total equity and `total_unrealized_profit` carries the pnl relative
/// to the initial balance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub total_balance: f64,
    pub available_balance: f64,
    pub total_unrealized_profit: f64,
    pub position_count: usize,
    pub margin_used_pct: f64,
}

/// Position snapshot embedded in decision records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: String,
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_profit: f64,
    pub leverage: f64,
    pub liquidation_price: f64,
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A scripted in-memory exchange for engine tests

    use crate::exchange::{AccountFill, Balance, ExchangeClient, ExchangePosition, OrderAck};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockExchange {
        pub balance: Mutex<Balance>,
        pub positions: Mutex<Vec<ExchangePosition>>,
        pub fills: Mutex<Vec<AccountFill>>,
        pub fail_close: Mutex<bool>,
        pub fail_stop_orders: Mutex<bool>,
        pub cancel_error: Mutex<Option<String>>,
        next_order_id: AtomicI64,
        pub closed: Mutex<Vec<(String, String)>>,
        pub stop_orders: Mutex<Vec<(String, String, f64)>>,
        pub take_orders: Mutex<Vec<(String, String, f64)>>,
        pub cancelled: Mutex<Vec<String>>,
    }

    impl MockExchange {
        pub fn new() -> Self {
            Self {
                next_order_id: AtomicI64::new(100),
                ..Default::default()
            }
        }

        pub fn set_balance(&self, wallet: f64, unrealized: f64, available: f64) {
            *self.balance.lock().unwrap() = Balance {
                total_wallet_balance: wallet,
                total_unrealized_profit: unrealized,
                available_balance: available,
            };
        }

        pub fn set_positions(&self, positions: Vec<ExchangePosition>) {
            *self.positions.lock().unwrap() = positions;
        }

        pub fn remove_position(&self, symbol: &str, side: &str) {
            self.positions
                .lock()
                .unwrap()
                .retain(|p| !(p.symbol == symbol && p.side == side));
        }

        fn next_id(&self) -> i64 {
            self.next_order_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    pub fn position(symbol: &str, side: &str, entry: f64, mark: f64, qty: f64, leverage: u32) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            side: side.to_string(),
            entry_price: entry,
            mark_price: mark,
            position_amt: if side == "long" { qty } else { -qty },
            unrealized_profit: 0.0,
            liquidation_price: 0.0,
            leverage,
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn get_balance(&self) -> Result<Balance> {
            Ok(self.balance.lock().unwrap().clone())
        }

        async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
            Ok(self.positions.lock().unwrap().clone())
        }

        async fn open_long(&self, _symbol: &str, _quantity: f64, _leverage: u32) -> Result<OrderAck> {
            Ok(OrderAck { order_id: self.next_id() })
        }

        async fn open_short(&self, _symbol: &str, _quantity: f64, _leverage: u32) -> Result<OrderAck> {
            Ok(OrderAck { order_id: self.next_id() })
        }

        async fn close_long(&self, symbol: &str, _quantity: f64) -> Result<OrderAck> {
            if *self.fail_close.lock().unwrap() {
                bail!("venue rejected close order");
            }
            self.closed
                .lock()
                .unwrap()
                .push((symbol.to_string(), "long".to_string()));
            self.remove_position(symbol, "long");
            Ok(OrderAck { order_id: self.next_id() })
        }

        async fn close_short(&self, symbol: &str, _quantity: f64) -> Result<OrderAck> {
            if *self.fail_close.lock().unwrap() {
                bail!("venue rejected close order");
            }
            self.closed
                .lock()
                .unwrap()
                .push((symbol.to_string(), "short".to_string()));
            self.remove_position(symbol, "short");
            Ok(OrderAck { order_id: self.next_id() })
        }

        async fn set_stop_loss(&self, symbol: &str, side: &str, _quantity: f64, price: f64) -> Result<()> {
            if *self.fail_stop_orders.lock().unwrap() {
                bail!("venue rejected stop order");
            }
            self.stop_orders
                .lock()
                .unwrap()
                .push((symbol.to_string(), side.to_string(), price));
            Ok(())
        }

        async fn set_take_profit(&self, symbol: &str, side: &str, _quantity: f64, price: f64) -> Result<()> {
            if *self.fail_stop_orders.lock().unwrap() {
                bail!("venue rejected take profit order");
            }
            self.take_orders
                .lock()
                .unwrap()
                .push((symbol.to_string(), side.to_string(), price));
            Ok(())
        }

        async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
            if let Some(message) = self.cancel_error.lock().unwrap().clone() {
                bail!("{}", message);
            }
            self.cancelled.lock().unwrap().push(symbol.to_string());
            Ok(())
        }

        async fn format_quantity(&self, _symbol: &str, quantity: f64) -> Result<String> {
            Ok(crate::exchange::aster::round_to_step(quantity, 0.001))
        }

        async fn get_account_trades(
            &self,
            symbol: Option<&str>,
            start_ms: i64,
            end_ms: i64,
            _limit: usize,
        ) -> Result<Vec<AccountFill>> {
            Ok(self
                .fills
                .lock()
                .unwrap()
                .iter()
                .filter(|f| symbol.map(|s| f.symbol == s).unwrap_or(true))
                .filter(|f| f.time_ms >= start_ms && f.time_ms <= end_ms)
                .cloned()
                .collect())
        }
    }
}
