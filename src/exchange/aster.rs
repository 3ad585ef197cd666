//! Aster futures REST client
//!
//! The Aster perp API follows the Binance futures surface: signed requests
//! carry a timestamp plus an HMAC-SHA256 signature of the query string, the
//! API key travels in a header. Lot-size steps are cached from exchangeInfo
//! so quantity formatting does not re-fetch per order.

use super::{canonical_time_ms, AccountFill, Balance, ExchangeClient, ExchangePosition, OrderAck};
use crate::logger::{self, LogTag};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://fapi.asterdex.com";
const RECV_WINDOW_MS: u64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

pub struct AsterClient {
    base_url: String,
    /// Main wallet address, sent as the user identity
    user: String,
    /// API key (signer address)
    api_key: String,
    /// Secret used for request signing
    api_secret: String,
    http: reqwest::Client,
    /// symbol -> lot step size, filled lazily from exchangeInfo
    lot_steps: Mutex<HashMap<String, f64>>,
}

impl AsterClient {
    pub fn new(user: &str, api_key: &str, api_secret: &str) -> Result<Self> {
        if user.is_empty() || api_key.is_empty() || api_secret.is_empty() {
            bail!("aster credentials must not be empty");
        }

        Ok(Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user: user.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .context("failed to build aster http client")?,
            lot_steps: Mutex::new(HashMap::new()),
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("user".to_string(), self.user.clone()));
        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
        params.push((
            "timestamp".to_string(),
            Utc::now().timestamp_millis().to_string(),
        ));

        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<serde_json::Value> {
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, query);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("request to {} failed", path))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("failed to read response from {}", path))?;

        if !status.is_success() {
            bail!("aster API error on {} (status {}): {}", path, status, body);
        }

        serde_json::from_str(&body)
            .map_err(|e| anyhow!("aster response parse failed on {}: {} (body: {:.300})", path, e, body))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.signed_request(
            reqwest::Method::POST,
            "/fapi/v1/leverage",
            vec![
                ("symbol".to_string(), symbol.to_string()),
                ("leverage".to_string(), leverage.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), "MARKET".to_string()),
        ];

        if quantity > 0.0 {
            let formatted = self.format_quantity(symbol, quantity).await?;
            params.push(("quantity".to_string(), formatted));
            if reduce_only {
                params.push(("reduceOnly".to_string(), "true".to_string()));
            }
        } else {
            // quantity 0 = flatten everything on that side
            params.push(("closePosition".to_string(), "true".to_string()));
        }

        let response = self
            .signed_request(reqwest::Method::POST, "/fapi/v1/order", params)
            .await?;

        let order_id = response
            .get("orderId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("order response missing orderId: {}", response))?;

        Ok(OrderAck { order_id })
    }

    async fn trigger_order(
        &self,
        symbol: &str,
        position_side: &str,
        quantity: f64,
        stop_price: f64,
        order_type: &str,
    ) -> Result<()> {
        // Exit orders trade against the position direction
        let side = if position_side == "LONG" { "SELL" } else { "BUY" };
        let formatted = self.format_quantity(symbol, quantity).await?;

        self.signed_request(
            reqwest::Method::POST,
            "/fapi/v1/order",
            vec![
                ("symbol".to_string(), symbol.to_string()),
                ("side".to_string(), side.to_string()),
                ("type".to_string(), order_type.to_string()),
                ("quantity".to_string(), formatted),
                ("stopPrice".to_string(), format!("{}", stop_price)),
                ("reduceOnly".to_string(), "true".to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn lot_step(&self, symbol: &str) -> Result<f64> {
        if let Some(step) = self.lot_steps.lock().unwrap().get(symbol) {
            return Ok(*step);
        }

        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let response: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("exchangeInfo parse failed")?;

        let mut step = 0.001; // conservative fallback
        if let Some(symbols) = response.get("symbols").and_then(|v| v.as_array()) {
            for entry in symbols {
                if entry.get("symbol").and_then(|v| v.as_str()) != Some(symbol) {
                    continue;
                }
                if let Some(filters) = entry.get("filters").and_then(|v| v.as_array()) {
                    for filter in filters {
                        if filter.get("filterType").and_then(|v| v.as_str()) == Some("LOT_SIZE") {
                            if let Some(s) = filter
                                .get("stepSize")
                                .and_then(|v| v.as_str())
                                .and_then(|s| s.parse::<f64>().ok())
                            {
                                step = s;
                            }
                        }
                    }
                }
            }
        }

        self.lot_steps
            .lock()
            .unwrap()
            .insert(symbol.to_string(), step);
        logger::debug(
            LogTag::Exchange,
            &format!("lot step for {} = {}", symbol, step),
        );
        Ok(step)
    }
}

/// Round a quantity down to a multiple of the lot step, rendered without
/// trailing zeros beyond the step's precision.
pub fn round_to_step(quantity: f64, step: f64) -> String {
    if step <= 0.0 {
        return format!("{}", quantity);
    }

    let rounded = (quantity / step).floor() * step;
    let decimals = step_decimals(step);
    format!("{:.*}", decimals, rounded)
}

fn step_decimals(step: f64) -> usize {
    let mut decimals = 0;
    let mut s = step;
    while s.fract() > 1e-9 && decimals < 8 {
        s *= 10.0;
        decimals += 1;
    }
    decimals
}

#[async_trait]
impl ExchangeClient for AsterClient {
    async fn get_balance(&self) -> Result<Balance> {
        let response = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/account", vec![])
            .await?;

        let field = |name: &str| -> f64 {
            response
                .get(name)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .or_else(|| response.get(name).and_then(|v| v.as_f64()))
                .unwrap_or(0.0)
        };

        Ok(Balance {
            total_wallet_balance: field("totalWalletBalance"),
            total_unrealized_profit: field("totalUnrealizedProfit"),
            available_balance: field("availableBalance"),
        })
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let response = self
            .signed_request(reqwest::Method::GET, "/fapi/v2/positionRisk", vec![])
            .await?;

        let rows = response
            .as_array()
            .ok_or_else(|| anyhow!("positionRisk response is not an array"))?;

        let parse_f64 = |row: &serde_json::Value, name: &str| -> f64 {
            row.get(name)
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .or_else(|| row.get(name).and_then(|v| v.as_f64()))
                .unwrap_or(0.0)
        };

        let mut positions = Vec::new();
        for row in rows {
            let amt = parse_f64(row, "positionAmt");
            if amt.abs() < f64::EPSILON {
                continue;
            }

            positions.push(ExchangePosition {
                symbol: row
                    .get("symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                side: if amt > 0.0 { "long" } else { "short" }.to_string(),
                entry_price: parse_f64(row, "entryPrice"),
                mark_price: parse_f64(row, "markPrice"),
                position_amt: amt,
                unrealized_profit: parse_f64(row, "unRealizedProfit"),
                liquidation_price: parse_f64(row, "liquidationPrice"),
                leverage: parse_f64(row, "leverage") as u32,
            });
        }
        Ok(positions)
    }

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        self.set_leverage(symbol, leverage).await?;
        self.market_order(symbol, "BUY", quantity, false).await
    }

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderAck> {
        self.set_leverage(symbol, leverage).await?;
        self.market_order(symbol, "SELL", quantity, false).await
    }

    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        self.market_order(symbol, "SELL", quantity, true).await
    }

    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderAck> {
        self.market_order(symbol, "BUY", quantity, true).await
    }

    async fn set_stop_loss(&self, symbol: &str, side: &str, quantity: f64, price: f64) -> Result<()> {
        self.trigger_order(symbol, side, quantity, price, "STOP_MARKET")
            .await
    }

    async fn set_take_profit(&self, symbol: &str, side: &str, quantity: f64, price: f64) -> Result<()> {
        self.trigger_order(symbol, side, quantity, price, "TAKE_PROFIT_MARKET")
            .await
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        self.signed_request(
            reqwest::Method::DELETE,
            "/fapi/v1/allOpenOrders",
            vec![("symbol".to_string(), symbol.to_string())],
        )
        .await?;
        Ok(())
    }

    async fn format_quantity(&self, symbol: &str, quantity: f64) -> Result<String> {
        let step = self.lot_step(symbol).await?;
        Ok(round_to_step(quantity, step))
    }

    async fn get_account_trades(
        &self,
        symbol: Option<&str>,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<AccountFill>> {
        let mut params = vec![
            ("startTime".to_string(), start_ms.to_string()),
            ("endTime".to_string(), end_ms.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(symbol) = symbol {
            params.push(("symbol".to_string(), symbol.to_string()));
        }

        let response = self
            .signed_request(reqwest::Method::GET, "/fapi/v1/userTrades", params)
            .await?;

        let rows = response
            .as_array()
            .ok_or_else(|| anyhow!("userTrades response is not an array"))?;

        let mut fills = Vec::new();
        for row in rows {
            let parse_f64 = |name: &str| -> f64 {
                row.get(name)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .or_else(|| row.get(name).and_then(|v| v.as_f64()))
                    .unwrap_or(0.0)
            };

            let order_id = row
                .get("orderId")
                .and_then(|v| v.as_i64())
                .or_else(|| {
                    row.get("orderId")
                        .and_then(|v| v.as_str())
                        .and_then(|s| s.parse().ok())
                })
                .unwrap_or(0);
            if order_id == 0 {
                continue;
            }

            let raw_time = parse_f64("time");
            let raw_time = if raw_time == 0.0 {
                parse_f64("timestamp")
            } else {
                raw_time
            };

            fills.push(AccountFill {
                order_id,
                symbol: row
                    .get("symbol")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                side: row
                    .get("side")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_uppercase(),
                price: parse_f64("price"),
                qty: parse_f64("qty"),
                realized_pnl: parse_f64("realizedPnl"),
                time_ms: canonical_time_ms(raw_time),
            });
        }
        Ok(fills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(0.03345, 0.001), "0.033");
        assert_eq!(round_to_step(1.999, 0.01), "1.99");
        assert_eq!(round_to_step(12.7, 1.0), "12");
        assert_eq!(round_to_step(0.12345678, 0.0001), "0.1234");
    }

    #[test]
    fn test_step_decimals() {
        assert_eq!(step_decimals(0.001), 3);
        assert_eq!(step_decimals(1.0), 0);
        assert_eq!(step_decimals(0.1), 1);
    }

    #[test]
    fn test_empty_credentials_rejected() {
        assert!(AsterClient::new("", "key", "secret").is_err());
        assert!(AsterClient::new("0xuser", "key", "secret").is_ok());
    }

    #[test]
    fn test_signature_is_deterministic() {
        let client = AsterClient::new("0xuser", "key", "secret").unwrap();
        let a = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        let b = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
