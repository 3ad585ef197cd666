//! Multi-timeframe analyzer
//!
//! Fetches 4h / 1h / 15m views per candidate symbol (on top of the 3m base
//! data already in the context), scores each timeframe and orders candidates
//! by the weighted result. Fetches go through a TTL cache so slow timeframes
//! are not re-pulled every cycle.

use super::types::Context;
use crate::config::MultiTimeframeConfig;
use crate::logger::{self, LogTag};
use crate::market;
use anyhow::Result;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Timeframes the analyzer adds beyond the 3m base series
const TIMEFRAMES: [(&str, &str, usize); 3] = [
    ("4h", "4 hour (4h)", 200),
    ("1h", "1 hour (1h)", 200),
    ("15m", "15 minute (15m)", 200),
];

struct CachedData {
    data: market::Data,
    fetched_at: Instant,
}

static TIMEFRAME_CACHE: Lazy<RwLock<HashMap<String, CachedData>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Analyzer output consumed by the prompt builder
#[derive(Debug, Default)]
pub struct AnalysisResult {
    /// Candidates ordered by weighted score, best first
    pub sorted_symbols: Vec<String>,
    /// Per-symbol weighted long-direction score
    pub symbol_scores: HashMap<String, SymbolScore>,
    /// Per-symbol (label, data) pairs in display order
    pub timeframe_data: HashMap<String, Vec<(String, market::Data)>>,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolScore {
    pub long_score: f64,
    pub short_score: f64,
    pub pullback_entry: bool,
}

pub struct MultiTimeframeAnalyzer {
    config: Option<MultiTimeframeConfig>,
}

impl MultiTimeframeAnalyzer {
    pub fn new(config: Option<MultiTimeframeConfig>) -> Self {
        Self { config }
    }

    fn ttl_for(&self, timeframe: &str) -> Duration {
        let seconds = match &self.config {
            Some(config) => match timeframe {
                "1d" => config.cache_ttl.daily,
                "4h" => config.cache_ttl.hourly4,
                "1h" => config.cache_ttl.hourly1,
                "15m" => config.cache_ttl.minute15,
                _ => config.cache_ttl.minute3,
            },
            None => 60,
        };
        Duration::from_secs(seconds.max(1))
    }

    async fn fetch_cached(&self, symbol: &str, timeframe: &str, limit: usize) -> Option<market::Data> {
        let key = format!("{}:{}", symbol, timeframe);
        let ttl = self.ttl_for(timeframe);

        let use_cache = self.config.as_ref().map(|c| c.enable_cache).unwrap_or(true);
        if use_cache {
            let cache = TIMEFRAME_CACHE.read().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < ttl {
                    return Some(entry.data.clone());
                }
            }
        }

        match market::get_with_timeframe(symbol, timeframe, limit).await {
            Ok(data) => {
                if use_cache {
                    TIMEFRAME_CACHE.write().unwrap().insert(
                        key,
                        CachedData {
                            data: data.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
                Some(data)
            }
            Err(e) => {
                logger::warning(
                    LogTag::Market,
                    &format!("{} {} fetch failed: {}", symbol, timeframe, e),
                );
                None
            }
        }
    }

    /// Score candidates and collect their per-timeframe data
    pub async fn analyze(&self, ctx: &Context) -> Result<AnalysisResult> {
        let mut result = AnalysisResult::default();

        let symbols: Vec<String> = ctx
            .candidate_coins
            .iter()
            .map(|c| c.symbol.clone())
            .filter(|s| ctx.market_data_map.contains_key(s))
            .collect();

        let weights = self.config.as_ref().map(|c| c.weights.clone());
        let pullback = self.config.as_ref().map(|c| c.pullback_entry.clone());

        for symbol in &symbols {
            let mut frames = Vec::new();
            let mut frame_scores: Vec<(f64, f64)> = Vec::new(); // (score, weight)

            for (timeframe, label, limit) in TIMEFRAMES {
                if let Some(data) = self.fetch_cached(symbol, timeframe, limit).await {
                    let weight = match (&weights, timeframe) {
                        (Some(w), "4h") => w.hourly4,
                        (Some(w), "1h") => w.hourly1,
                        (Some(w), "15m") => w.minute15,
                        _ => 1.0 / TIMEFRAMES.len() as f64,
                    };
                    frame_scores.push((timeframe_quality_score(&data), weight));
                    frames.push((label.to_string(), data));
                }
            }

            // The 3m base data participates with its configured weight
            if let Some(base) = ctx.market_data_map.get(symbol) {
                let weight = weights.as_ref().map(|w| w.minute3).unwrap_or(0.0);
                if weight > 0.0 {
                    frame_scores.push((timeframe_quality_score(base), weight));
                }
            }

            let mut long_score = weighted_score(&frame_scores);

            // Pullback bonus: higher frames agree long while the lowest frame
            // shows a counter-trend dip that may be reversing
            let mut is_pullback = false;
            if let Some(pullback) = &pullback {
                if pullback.enable && frame_scores.len() >= 3 {
                    let higher_aligned =
                        frame_scores[0].0 > 0.6 && frame_scores[1].0 > 0.6;
                    let lower_counter = frame_scores[frame_scores.len() - 1].0 < 0.45;
                    if higher_aligned && lower_counter {
                        long_score = (long_score + pullback.bonus_score).min(1.0);
                        is_pullback = true;
                    }
                }
            }

            result.symbol_scores.insert(
                symbol.clone(),
                SymbolScore {
                    long_score,
                    short_score: 1.0 - long_score,
                    pullback_entry: is_pullback,
                },
            );
            result.timeframe_data.insert(symbol.clone(), frames);
        }

        let mut sorted = symbols;
        sorted.sort_by(|a, b| {
            let score_a = result.symbol_scores.get(a).map(|s| s.long_score.max(s.short_score)).unwrap_or(0.0);
            let score_b = result.symbol_scores.get(b).map(|s| s.long_score.max(s.short_score)).unwrap_or(0.0);
            score_b.partial_cmp(&score_a).unwrap_or(std::cmp::Ordering::Equal)
        });
        result.sorted_symbols = sorted;

        Ok(result)
    }
}

/// Quality score for one timeframe in [0, 1], long-direction biased.
///
/// Combines price-vs-EMA20 distance, MACD sign and the RSI band.
pub fn timeframe_quality_score(data: &market::Data) -> f64 {
    let mut score = 0.0;
    let mut count = 0;

    if data.current_ema20 > 0.0 && data.current_price > 0.0 {
        let ema_ratio = (data.current_price - data.current_ema20) / data.current_ema20;
        score += if ema_ratio > 0.02 {
            0.8
        } else if ema_ratio > 0.0 {
            0.6
        } else if ema_ratio < -0.02 {
            0.2
        } else {
            0.4
        };
        count += 1;
    }

    if data.current_macd != 0.0 {
        score += if data.current_macd > 0.0 { 0.7 } else { 0.3 };
        count += 1;
    }

    if data.current_rsi7 > 0.0 {
        score += if data.current_rsi7 > 30.0 && data.current_rsi7 < 70.0 {
            0.8
        } else if data.current_rsi7 >= 70.0 {
            0.2
        } else {
            0.3
        };
        count += 1;
    }

    if count == 0 {
        return 0.5;
    }
    (score / count as f64).clamp(0.0, 1.0)
}

fn weighted_score(frame_scores: &[(f64, f64)]) -> f64 {
    let total_weight: f64 = frame_scores.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return 0.5;
    }
    frame_scores.iter().map(|(s, w)| s * w).sum::<f64>() / total_weight
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(price: f64, ema20: f64, macd: f64, rsi7: f64) -> market::Data {
        market::Data {
            current_price: price,
            current_ema20: ema20,
            current_macd: macd,
            current_rsi7: rsi7,
            ..Default::default()
        }
    }

    #[test]
    fn test_score_bullish_frame() {
        // Strong uptrend, healthy RSI
        let score = timeframe_quality_score(&data(103.0, 100.0, 5.0, 55.0));
        assert!(score > 0.7);
    }

    #[test]
    fn test_score_bearish_frame() {
        let score = timeframe_quality_score(&data(97.0, 100.0, -5.0, 25.0));
        assert!(score < 0.35);
    }

    #[test]
    fn test_score_overbought_penalized() {
        let healthy = timeframe_quality_score(&data(103.0, 100.0, 5.0, 55.0));
        let overbought = timeframe_quality_score(&data(103.0, 100.0, 5.0, 85.0));
        assert!(overbought < healthy);
    }

    #[test]
    fn test_score_no_data_is_neutral() {
        assert_eq!(timeframe_quality_score(&market::Data::default()), 0.5);
    }

    #[test]
    fn test_weighted_score() {
        let frames = vec![(0.8, 0.5), (0.4, 0.5)];
        assert!((weighted_score(&frames) - 0.6).abs() < 1e-9);
        assert_eq!(weighted_score(&[]), 0.5);
    }
}
