//! Candidate-coin pool
//!
//! Supplies the symbols each cycle offers to the decision engine. The pool
//! is seeded from the configured mainstream list; scores default to 0 until
//! an external ranker feeds them.

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::market;

#[derive(Debug, Clone)]
pub struct CoinInfo {
    pub pair: String,
    pub score: f64,
    pub is_available: bool,
}

#[derive(Debug, Clone, Default)]
struct PoolConfig {
    use_default_coins: bool,
    default_coins: Vec<String>,
}

static POOL_CONFIG: Lazy<RwLock<PoolConfig>> = Lazy::new(|| {
    RwLock::new(PoolConfig {
        use_default_coins: true,
        default_coins: vec![
            "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT",
            "HYPEUSDT",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    })
});

/// Configure the pool from the loaded config
pub fn configure(use_default_coins: bool, default_coins: &[String]) {
    let mut config = POOL_CONFIG.write().unwrap();
    config.use_default_coins = use_default_coins;
    if !default_coins.is_empty() {
        config.default_coins = default_coins.to_vec();
    }
}

/// Current pool contents
pub fn get_coin_pool() -> Vec<CoinInfo> {
    let config = POOL_CONFIG.read().unwrap();
    config
        .default_coins
        .iter()
        .map(|symbol| CoinInfo {
            pair: market::normalize(symbol),
            score: 0.0,
            is_available: true,
        })
        .collect()
}

/// Top N pool symbols by score (ties keep configured order)
pub fn get_top_rated_coins(limit: usize) -> Result<Vec<String>> {
    let mut coins: Vec<CoinInfo> = get_coin_pool()
        .into_iter()
        .filter(|c| c.is_available)
        .collect();
    if coins.is_empty() {
        bail!("coin pool is empty");
    }

    coins.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(coins.into_iter().take(limit).map(|c| c.pair).collect())
}

/// Pool view with per-symbol source attribution
#[derive(Debug, Clone, Default)]
pub struct MergedCoinPool {
    pub all_symbols: Vec<String>,
    pub symbol_sources: HashMap<String, Vec<String>>,
}

pub fn get_merged_coin_pool(limit: usize) -> Result<MergedCoinPool> {
    let symbols = get_top_rated_coins(limit)?;

    let mut symbol_sources = HashMap::new();
    for symbol in &symbols {
        symbol_sources.insert(symbol.clone(), vec!["default".to_string()]);
    }

    Ok(MergedCoinPool {
        all_symbols: symbols,
        symbol_sources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the pool config is process-global
    #[test]
    fn test_pool_configure_and_merge() {
        configure(
            true,
            &["btc".to_string(), "ethusdt".to_string(), "SOLUSDT".to_string()],
        );

        let pool = get_coin_pool();
        assert_eq!(pool[0].pair, "BTCUSDT");
        assert_eq!(pool[1].pair, "ETHUSDT");

        let merged = get_merged_coin_pool(2).unwrap();
        assert_eq!(merged.all_symbols.len(), 2);
        assert_eq!(
            merged.symbol_sources.get("BTCUSDT"),
            Some(&vec!["default".to_string()])
        );
    }
}
