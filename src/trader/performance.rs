//! Historical performance analysis
//!
//! Recomputed from finalized trade rows whenever the prompt builder or the
//! read API asks for it. The Sharpe ratio uses per-trade pnl mean over
//! standard deviation, which is rough but stable across restarts.

use super::recorder::resolve_close_reason;
use crate::storage::TradeRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One completed trade as shown to the model / API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub leverage: u32,
    pub open_price: f64,
    pub close_price: f64,
    pub position_value: f64,
    pub margin_used: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub duration: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub open_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub close_time: DateTime<Utc>,
    pub was_stop_loss: bool,
    pub close_reason: String,
}

/// Per-symbol aggregate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolPerformance {
    pub symbol: String,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
}

/// Overall performance view
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
    pub recent_trades: Vec<TradeOutcome>,
    pub symbol_stats: HashMap<String, SymbolPerformance>,
    pub best_symbol: String,
    pub worst_symbol: String,
}

/// Build the analysis from finalized trade rows
pub fn analyze_trades(trades: &[TradeRecord]) -> PerformanceAnalysis {
    let finalized: Vec<&TradeRecord> =
        trades.iter().filter(|t| t.close_time.is_some()).collect();

    let mut analysis = PerformanceAnalysis {
        total_trades: finalized.len(),
        ..Default::default()
    };
    if finalized.is_empty() {
        return analysis;
    }

    let mut total_win = 0.0;
    let mut total_loss = 0.0;
    let mut pnls = Vec::with_capacity(finalized.len());

    for trade in &finalized {
        pnls.push(trade.pnl);
        if trade.pnl > 0.0 {
            analysis.winning_trades += 1;
            total_win += trade.pnl;
        } else {
            analysis.losing_trades += 1;
            total_loss += -trade.pnl;
        }

        let entry = analysis
            .symbol_stats
            .entry(trade.symbol.clone())
            .or_insert_with(|| SymbolPerformance {
                symbol: trade.symbol.clone(),
                ..Default::default()
            });
        entry.total_trades += 1;
        if trade.pnl > 0.0 {
            entry.winning_trades += 1;
        } else {
            entry.losing_trades += 1;
        }
        entry.total_pnl += trade.pnl;
    }

    analysis.win_rate = analysis.winning_trades as f64 / finalized.len() as f64 * 100.0;
    if analysis.winning_trades > 0 {
        analysis.avg_win = total_win / analysis.winning_trades as f64;
    }
    if analysis.losing_trades > 0 {
        analysis.avg_loss = total_loss / analysis.losing_trades as f64;
    }
    if total_loss > 0.0 {
        analysis.profit_factor = total_win / total_loss;
    } else if total_win > 0.0 {
        analysis.profit_factor = f64::INFINITY;
    }

    analysis.sharpe_ratio = sharpe_ratio(&pnls);

    for stats in analysis.symbol_stats.values_mut() {
        stats.win_rate = stats.winning_trades as f64 / stats.total_trades as f64 * 100.0;
        stats.avg_pnl = stats.total_pnl / stats.total_trades as f64;
    }

    if let Some(best) = analysis
        .symbol_stats
        .values()
        .max_by(|a, b| a.total_pnl.partial_cmp(&b.total_pnl).unwrap_or(std::cmp::Ordering::Equal))
    {
        analysis.best_symbol = best.symbol.clone();
    }
    if let Some(worst) = analysis
        .symbol_stats
        .values()
        .min_by(|a, b| a.total_pnl.partial_cmp(&b.total_pnl).unwrap_or(std::cmp::Ordering::Equal))
    {
        analysis.worst_symbol = worst.symbol.clone();
    }

    // Recent trades, latest close first
    let mut sorted: Vec<&TradeRecord> = finalized.clone();
    sorted.sort_by_key(|t| std::cmp::Reverse(t.close_time));
    analysis.recent_trades = sorted
        .into_iter()
        .take(20)
        .map(|trade| TradeOutcome {
            symbol: trade.symbol.clone(),
            side: trade.side.clone(),
            quantity: trade.open_quantity,
            leverage: trade.open_leverage,
            open_price: trade.open_price,
            close_price: trade.close_price,
            position_value: trade.position_value,
            margin_used: trade.margin_used,
            pnl: trade.pnl,
            pnl_pct: trade.pnl_pct,
            duration: trade.duration.clone(),
            open_time: trade.open_time,
            close_time: trade.close_time.unwrap_or(trade.open_time),
            was_stop_loss: trade.was_stop_loss,
            close_reason: resolve_close_reason(trade),
        })
        .collect();

    analysis
}

fn sharpe_ratio(pnls: &[f64]) -> f64 {
    if pnls.len() < 2 {
        return 0.0;
    }
    let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
    let variance =
        pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (pnls.len() - 1) as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    mean / std_dev
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(symbol: &str, pnl: f64, closed: bool) -> TradeRecord {
        TradeRecord {
            symbol: symbol.to_string(),
            side: "long".to_string(),
            pnl,
            close_time: closed.then(Utc::now),
            close_reason: "done".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_input() {
        let analysis = analyze_trades(&[]);
        assert_eq!(analysis.total_trades, 0);
        assert!(analysis.recent_trades.is_empty());
    }

    #[test]
    fn test_open_rows_excluded() {
        let trades = vec![trade("BTCUSDT", 10.0, true), trade("BTCUSDT", 0.0, false)];
        let analysis = analyze_trades(&trades);
        assert_eq!(analysis.total_trades, 1);
    }

    #[test]
    fn test_win_rate_and_profit_factor() {
        let trades = vec![
            trade("BTCUSDT", 100.0, true),
            trade("BTCUSDT", -50.0, true),
            trade("ETHUSDT", 30.0, true),
            trade("ETHUSDT", -30.0, true),
        ];
        let analysis = analyze_trades(&trades);

        assert_eq!(analysis.total_trades, 4);
        assert_eq!(analysis.winning_trades, 2);
        assert!((analysis.win_rate - 50.0).abs() < 1e-9);
        assert!((analysis.avg_win - 65.0).abs() < 1e-9);
        assert!((analysis.avg_loss - 40.0).abs() < 1e-9);
        assert!((analysis.profit_factor - 130.0 / 80.0).abs() < 1e-9);

        assert_eq!(analysis.best_symbol, "BTCUSDT"); // +50 vs 0
        assert_eq!(analysis.worst_symbol, "ETHUSDT");

        let btc = &analysis.symbol_stats["BTCUSDT"];
        assert_eq!(btc.total_trades, 2);
        assert!((btc.total_pnl - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_stability() {
        assert_eq!(sharpe_ratio(&[]), 0.0);
        assert_eq!(sharpe_ratio(&[5.0]), 0.0);
        assert_eq!(sharpe_ratio(&[5.0, 5.0, 5.0]), 0.0); // zero variance
        assert!(sharpe_ratio(&[10.0, 20.0, 15.0]) > 0.0);
        assert!(sharpe_ratio(&[-10.0, -20.0, -15.0]) < 0.0);
    }
}
