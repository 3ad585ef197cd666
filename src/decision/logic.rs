//! Per-position logic records and their validity check
//!
//! When a position opens, the model's entry reasoning and planned exit are
//! captured together with a multi-timeframe trend summary. Later cycles
//! compare that stored trend to the current one; a position is only marked
//! invalid when the market has turned against its side, not when it merely
//! weakens to neutral.

use crate::decision::types::Context;
use crate::market;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Durable logic attached to a (symbol, side)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionLogic {
    pub entry_logic: Option<EntryLogic>,
    pub exit_logic: Option<ExitLogic>,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
}

/// Reasoning captured when the position was opened
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryLogic {
    pub reasoning: String,
    #[serde(default)]
    pub conditions: Vec<LogicCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_timeframe: Option<MultiTimeframeLogic>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Planned exit captured at open (or refreshed on close decisions)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitLogic {
    pub reasoning: String,
    #[serde(default)]
    pub conditions: Vec<LogicCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_timeframe: Option<MultiTimeframeLogic>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Structured condition slot; currently carried verbatim, reserved for
/// smarter extraction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogicCondition {
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub timeframe: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub operator: String,
}

/// Higher-timeframe direction summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiTimeframeLogic {
    /// "long", "short" or "neutral"
    pub major_trend: String,
    #[serde(default)]
    pub pullback_entry: bool,
    #[serde(default)]
    pub timeframes: HashMap<String, String>,
}

/// Derive the current major trend from EMA20 and MACD.
///
/// Direction requires price to sit more than 0.1% away from the EMA and the
/// MACD histogram to clear a price-scaled threshold; anything else reads as
/// neutral.
pub fn derive_major_trend(data: &market::Data) -> String {
    if data.current_ema20 <= 0.0 || data.current_price <= 0.0 {
        return "neutral".to_string();
    }

    let ema_ratio = (data.current_price - data.current_ema20) / data.current_ema20;
    let price_above = ema_ratio > 0.001;
    let price_below = ema_ratio < -0.001;

    let macd_threshold = (data.current_price * 1e-5).max(1.0);
    let macd_positive = data.current_macd > macd_threshold;
    let macd_negative = data.current_macd < -macd_threshold;

    if price_above && macd_positive {
        "long".to_string()
    } else if price_below && macd_negative {
        "short".to_string()
    } else {
        "neutral".to_string()
    }
}

fn extract_multi_timeframe(ctx: &Context, symbol: &str) -> MultiTimeframeLogic {
    let mut logic = MultiTimeframeLogic::default();
    if let Some(data) = ctx.market_data_map.get(symbol) {
        logic.major_trend = derive_major_trend(data);
    }
    logic
}

/// Build an entry logic record from the model's reasoning text
pub fn extract_entry_logic(reasoning: &str, ctx: &Context, symbol: &str) -> EntryLogic {
    EntryLogic {
        reasoning: reasoning.to_string(),
        conditions: Vec::new(),
        multi_timeframe: ctx
            .multi_timeframe_config
            .is_some()
            .then(|| extract_multi_timeframe(ctx, symbol)),
        timestamp: Some(Utc::now()),
    }
}

/// Build an exit logic record from the model's reasoning text
pub fn extract_exit_logic(reasoning: &str, ctx: &Context, symbol: &str) -> ExitLogic {
    ExitLogic {
        reasoning: reasoning.to_string(),
        conditions: Vec::new(),
        multi_timeframe: ctx
            .multi_timeframe_config
            .is_some()
            .then(|| extract_multi_timeframe(ctx, symbol)),
        timestamp: Some(Utc::now()),
    }
}

/// Check whether a position's stored logic still holds.
///
/// Returns (invalid, reasons). Invalidation is side-aware: a long is only
/// invalid when the current trend is short, a short only when it is long.
/// Weakening to neutral keeps the position valid.
pub fn check_logic_validity(
    logic: Option<&PositionLogic>,
    data: &market::Data,
    side: &str,
) -> (bool, Vec<String>) {
    let Some(logic) = logic else {
        return (true, vec!["no logic recorded".to_string()]);
    };

    let mut reasons = Vec::new();

    if let Some(entry) = &logic.entry_logic {
        if let Some(mtf) = &entry.multi_timeframe {
            reasons.extend(check_trend_against_side(mtf, data, side));
        }
    }
    if let Some(exit) = &logic.exit_logic {
        if let Some(mtf) = &exit.multi_timeframe {
            reasons.extend(check_trend_against_side(mtf, data, side));
        }
    }

    let reasons = deduplicate_reasons(reasons);
    (!reasons.is_empty(), reasons)
}

fn check_trend_against_side(
    mtf: &MultiTimeframeLogic,
    data: &market::Data,
    side: &str,
) -> Vec<String> {
    if mtf.major_trend.is_empty() {
        return Vec::new();
    }

    let current = derive_major_trend(data);
    if current == mtf.major_trend {
        return Vec::new();
    }

    match side {
        "long" if current == "short" => vec![format!(
            "major trend changed from {} to {} (against long position)",
            mtf.major_trend, current
        )],
        "short" if current == "long" => vec![format!(
            "major trend changed from {} to {} (against short position)",
            mtf.major_trend, current
        )],
        "long" | "short" => Vec::new(),
        // Unknown side: only a hard long/short flip counts
        _ => {
            if mtf.major_trend != "neutral" && current != "neutral" {
                vec![format!(
                    "major trend changed from {} to {}",
                    mtf.major_trend, current
                )]
            } else {
                Vec::new()
            }
        }
    }
}

/// Drop repeated invalidation strings, keeping first occurrence order
pub fn deduplicate_reasons(reasons: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    reasons
        .into_iter()
        .filter(|reason| seen.insert(reason.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(price: f64, ema20: f64, macd: f64) -> market::Data {
        market::Data {
            symbol: "BTCUSDT".to_string(),
            current_price: price,
            current_ema20: ema20,
            current_macd: macd,
            ..Default::default()
        }
    }

    fn logic_with_trend(trend: &str) -> PositionLogic {
        PositionLogic {
            entry_logic: Some(EntryLogic {
                reasoning: "test".to_string(),
                multi_timeframe: Some(MultiTimeframeLogic {
                    major_trend: trend.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_trend_derivation() {
        // Price 1% above EMA with strong positive MACD
        assert_eq!(derive_major_trend(&data(60_600.0, 60_000.0, 50.0)), "long");
        // Price 1% below EMA with strong negative MACD
        assert_eq!(derive_major_trend(&data(59_400.0, 60_000.0, -50.0)), "short");
        // Price hugging the EMA reads as neutral
        assert_eq!(derive_major_trend(&data(60_010.0, 60_000.0, 50.0)), "neutral");
        // MACD below the price-scaled threshold reads as neutral
        assert_eq!(derive_major_trend(&data(60_600.0, 60_000.0, 0.3)), "neutral");
    }

    #[test]
    fn test_macd_threshold_scales_with_price() {
        // Threshold is max(1.0, price * 1e-5); for BTC at 60k that is 0.6 -> 1.0
        assert_eq!(derive_major_trend(&data(60_600.0, 60_000.0, 0.9)), "neutral");
        assert_eq!(derive_major_trend(&data(60_600.0, 60_000.0, 1.1)), "long");
    }

    #[test]
    fn test_long_invalidated_only_by_short_trend() {
        let logic = logic_with_trend("long");

        // Trend flipped to short: invalid
        let (invalid, reasons) =
            check_logic_validity(Some(&logic), &data(59_400.0, 60_000.0, -50.0), "long");
        assert!(invalid);
        assert_eq!(reasons.len(), 1);

        // Trend weakened to neutral: still valid
        let (invalid, _) =
            check_logic_validity(Some(&logic), &data(60_010.0, 60_000.0, 0.0), "long");
        assert!(!invalid);
    }

    #[test]
    fn test_short_invalidated_only_by_long_trend() {
        let logic = logic_with_trend("short");

        let (invalid, _) =
            check_logic_validity(Some(&logic), &data(60_600.0, 60_000.0, 50.0), "short");
        assert!(invalid);

        let (invalid, _) =
            check_logic_validity(Some(&logic), &data(60_010.0, 60_000.0, 0.0), "short");
        assert!(!invalid);
    }

    #[test]
    fn test_missing_logic_is_invalid() {
        let (invalid, reasons) = check_logic_validity(None, &data(1.0, 1.0, 0.0), "long");
        assert!(invalid);
        assert_eq!(reasons, vec!["no logic recorded".to_string()]);
    }

    #[test]
    fn test_identical_reasons_deduplicated() {
        // Entry and exit logic carry the same stale trend: one reason only
        let mut logic = logic_with_trend("long");
        logic.exit_logic = Some(ExitLogic {
            reasoning: "plan".to_string(),
            multi_timeframe: Some(MultiTimeframeLogic {
                major_trend: "long".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });

        let (invalid, reasons) =
            check_logic_validity(Some(&logic), &data(59_400.0, 60_000.0, -50.0), "long");
        assert!(invalid);
        assert_eq!(reasons.len(), 1);
    }
}
