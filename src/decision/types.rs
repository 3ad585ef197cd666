//! Context and decision types exchanged with the LLM

use crate::config::MultiTimeframeConfig;
use crate::decision::logic::{EntryLogic, ExitLogic};
use crate::market;
use crate::trader::performance::PerformanceAnalysis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One position as shown to the model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// "long" or "short"
    pub side: String,
    pub entry_price: f64,
    pub mark_price: f64,
    pub quantity: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    pub margin_used: f64,
    /// First-seen timestamp, milliseconds since epoch (0 = unknown)
    pub update_time: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub stop_loss: f64,
    #[serde(skip_serializing_if = "is_zero")]
    pub take_profit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_logic: Option<EntryLogic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_logic: Option<ExitLogic>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub logic_invalid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invalid_reasons: Vec<String>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Account summary as shown to the model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_equity: f64,
    pub available_balance: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

/// Candidate symbol plus where it came from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateCoin {
    pub symbol: String,
    pub sources: Vec<String>,
}

/// Everything the prompt builder needs for one cycle
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub current_time: String,
    pub runtime_minutes: i64,
    pub call_count: i64,
    pub account: AccountInfo,
    pub positions: Vec<PositionInfo>,
    pub candidate_coins: Vec<CandidateCoin>,
    pub market_data_map: HashMap<String, market::Data>,
    pub performance: Option<PerformanceAnalysis>,
    pub recent_forced_closes: Vec<String>,
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
    pub skip_liquidity_check: bool,
    pub analysis_mode: String,
    pub multi_timeframe_config: Option<MultiTimeframeConfig>,
    pub strategy_name: String,
    pub strategy_preference: String,
}

impl Context {
    /// Leverage cap for one symbol (majors vs altcoins)
    pub fn leverage_for(&self, symbol: &str) -> u32 {
        if symbol == "BTCUSDT" || symbol == "ETHUSDT" {
            self.btc_eth_leverage
        } else {
            self.altcoin_leverage
        }
    }

    /// True when all current positions plus `symbol` share a single symbol
    pub fn is_single_symbol(&self, symbol: &str) -> bool {
        if self.positions.is_empty() {
            return true;
        }
        let mut symbols: Vec<&str> = self.positions.iter().map(|p| p.symbol.as_str()).collect();
        symbols.sort();
        symbols.dedup();
        symbols.len() == 1 && symbols[0] == symbol
    }
}

/// One decision as produced by the model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    /// open_long | open_short | close_long | close_short | update_sl |
    /// update_tp | hold | wait
    pub action: String,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default)]
    pub position_size_usd: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
    #[serde(default)]
    pub confidence: u32,
    #[serde(default)]
    pub risk_usd: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub exit_reasoning: String,
}

impl Decision {
    pub fn is_open(&self) -> bool {
        self.action == "open_long" || self.action == "open_short"
    }

    pub fn is_close(&self) -> bool {
        self.action == "close_long" || self.action == "close_short"
    }

    /// The position side this decision targets, when derivable
    pub fn target_side(&self) -> Option<&'static str> {
        match self.action.as_str() {
            "open_long" | "close_long" => Some("long"),
            "open_short" | "close_short" => Some("short"),
            _ => None,
        }
    }
}

/// Parsed model output: chain-of-thought prefix + decision list
#[derive(Debug, Clone, Default)]
pub struct FullDecision {
    pub user_prompt: String,
    pub cot_trace: String,
    pub decisions: Vec<Decision>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_side_helpers() {
        let open = Decision {
            action: "open_long".to_string(),
            ..Default::default()
        };
        assert!(open.is_open());
        assert_eq!(open.target_side(), Some("long"));

        let hold = Decision {
            action: "hold".to_string(),
            ..Default::default()
        };
        assert!(!hold.is_open());
        assert!(hold.target_side().is_none());
    }

    #[test]
    fn test_single_symbol_detection() {
        let mut ctx = Context::default();
        assert!(ctx.is_single_symbol("BTCUSDT"));

        ctx.positions.push(PositionInfo {
            symbol: "BTCUSDT".to_string(),
            ..Default::default()
        });
        assert!(ctx.is_single_symbol("BTCUSDT"));
        assert!(!ctx.is_single_symbol("ETHUSDT"));

        ctx.positions.push(PositionInfo {
            symbol: "ETHUSDT".to_string(),
            ..Default::default()
        });
        assert!(!ctx.is_single_symbol("BTCUSDT"));
    }

    #[test]
    fn test_leverage_for_symbol_class() {
        let ctx = Context {
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            ..Default::default()
        };
        assert_eq!(ctx.leverage_for("BTCUSDT"), 10);
        assert_eq!(ctx.leverage_for("ETHUSDT"), 10);
        assert_eq!(ctx.leverage_for("SOLUSDT"), 5);
    }
}
