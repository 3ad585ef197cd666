//! Exchange access
//!
//! `ExchangeClient` is the seam the trader engine works against; `aster`
//! implements it for the Aster futures REST API. Everything above this
//! module speaks in the normalized types below.

pub mod aster;

pub use aster::AsterClient;

use anyhow::Result;
use async_trait::async_trait;

/// Account balance snapshot
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Balance {
    pub total_wallet_balance: f64,
    pub total_unrealized_profit: f64,
    pub available_balance: f64,
}

impl Balance {
    pub fn total_equity(&self) -> f64 {
        self.total_wallet_balance + self.total_unrealized_profit
    }
}

/// One open position as reported by the venue
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// "long" or "short"
    pub side: String,
    pub entry_price: f64,
    pub mark_price: f64,
    /// Signed amount; negative for shorts
    pub position_amt: f64,
    pub unrealized_profit: f64,
    pub liquidation_price: f64,
    pub leverage: u32,
}

impl ExchangePosition {
    pub fn quantity(&self) -> f64 {
        self.position_amt.abs()
    }
}

/// Acknowledgement of a submitted order
#[derive(Debug, Clone, Default)]
pub struct OrderAck {
    pub order_id: i64,
}

/// One account fill from trade history
#[derive(Debug, Clone, Default)]
pub struct AccountFill {
    pub order_id: i64,
    pub symbol: String,
    /// "BUY" or "SELL"
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub realized_pnl: f64,
    /// Milliseconds since epoch, unit auto-detected at parse time
    pub time_ms: i64,
}

/// REST-level venue operations the trader engine needs
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_balance(&self) -> Result<Balance>;
    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck>;
    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck>;

    /// quantity 0 closes the whole position
    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck>;
    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck>;

    /// side is "LONG" or "SHORT"
    async fn set_stop_loss(&self, symbol: &str, side: &str, quantity: f64, price: f64) -> Result<()>;
    async fn set_take_profit(&self, symbol: &str, side: &str, quantity: f64, price: f64) -> Result<()>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    /// Round a quantity to the venue's lot precision, as a decimal string
    async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<String>;

    async fn get_account_trades(
        &self,
        symbol: Option<&str>,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<AccountFill>>;
}

/// Whether a cancel error just means there was nothing to cancel
pub fn is_no_orders_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no orders") || lower.contains("not found")
}

/// Venue timestamps come in seconds or milliseconds; values below 1e12 are
/// seconds.
pub fn canonical_time_ms(raw: f64) -> i64 {
    if raw < 1e12 {
        (raw * 1000.0) as i64
    } else {
        raw as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_orders_detection() {
        assert!(is_no_orders_error("code -2011: No orders present"));
        assert!(is_no_orders_error("Order NOT FOUND"));
        assert!(!is_no_orders_error("insufficient margin"));
    }

    #[test]
    fn test_time_unit_autodetect() {
        // Seconds get promoted to milliseconds
        assert_eq!(canonical_time_ms(1_700_000_000.0), 1_700_000_000_000);
        // Milliseconds pass through
        assert_eq!(canonical_time_ms(1_700_000_000_123.0), 1_700_000_000_123);
    }

    #[test]
    fn test_position_quantity_unsigned() {
        let pos = ExchangePosition {
            position_amt: -0.5,
            ..Default::default()
        };
        assert_eq!(pos.quantity(), 0.5);
    }
}
