//! TOML configuration loading and validation
//!
//! One `[[traders]]` block per trader plus global risk, leverage, analysis
//! and API-server settings. Defaults are filled during `Config::validate()`
//! so the rest of the code never sees a half-configured value.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Configuration for a single trader instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    /// "qwen", "deepseek" or "custom"
    pub ai_model: String,

    /// Trading venue, currently only "aster"
    #[serde(default)]
    pub exchange: String,

    #[serde(default)]
    pub aster_user: String,
    #[serde(default)]
    pub aster_signer: String,
    #[serde(default)]
    pub aster_private_key: String,

    #[serde(default)]
    pub qwen_key: String,
    #[serde(default)]
    pub deepseek_key: String,

    // Custom OpenAI-compatible endpoint
    #[serde(default)]
    pub custom_api_url: String,
    #[serde(default)]
    pub custom_api_key: String,
    #[serde(default)]
    pub custom_model_name: String,

    pub initial_balance: f64,
    pub scan_interval_minutes: u64,
}

impl TraderConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_minutes * 60)
    }
}

/// Leverage caps per symbol class
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeverageConfig {
    pub btc_eth_leverage: u32,
    pub altcoin_leverage: u32,
}

/// Analysis mode: "standard" or "multi_timeframe"
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisModeConfig {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub multi_timeframe: Option<MultiTimeframeConfig>,
}

/// Multi-timeframe analyzer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiTimeframeConfig {
    #[serde(default)]
    pub weights: TimeframeWeights,
    #[serde(default)]
    pub min_consistency_score: f64,
    #[serde(default)]
    pub enable_cache: bool,
    #[serde(default)]
    pub cache_ttl: TimeframeCacheTtl,
    #[serde(default)]
    pub pullback_entry: PullbackEntryConfig,
}

/// Per-timeframe score weights, should sum to 1.0
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeframeWeights {
    #[serde(default)]
    pub daily: f64,
    #[serde(default)]
    pub hourly4: f64,
    #[serde(default)]
    pub hourly1: f64,
    #[serde(default)]
    pub minute15: f64,
    #[serde(default)]
    pub minute3: f64,
}

/// Cache TTLs per timeframe, in seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeframeCacheTtl {
    #[serde(default)]
    pub daily: u64,
    #[serde(default)]
    pub hourly4: u64,
    #[serde(default)]
    pub hourly1: u64,
    #[serde(default)]
    pub minute15: u64,
    #[serde(default)]
    pub minute3: u64,
}

/// Pullback entry scoring bonus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullbackEntryConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub bonus_score: f64,
}

/// Trading strategy selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub preference: String,
}

/// Read-API server settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiServerConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub enable_rate_limit: bool,
    #[serde(default)]
    pub rate_limit_rps: u32,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub traders: Vec<TraderConfig>,
    #[serde(default)]
    pub use_default_coins: bool,
    #[serde(default)]
    pub default_coins: Vec<String>,
    #[serde(default)]
    pub api_server_port: u16,
    #[serde(default)]
    pub max_daily_loss: f64,
    #[serde(default)]
    pub max_drawdown: f64,
    #[serde(default)]
    pub stop_trading_minutes: u64,
    #[serde(default)]
    pub position_stop_loss_pct: f64,
    #[serde(default)]
    pub position_take_profit_pct: f64,
    #[serde(default)]
    pub leverage: LeverageConfig,
    #[serde(default)]
    pub skip_liquidity_check: bool,
    #[serde(default)]
    pub analysis_mode: AnalysisModeConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub api_server_config: ApiServerConfig,
}

impl Config {
    /// Load and validate a TOML config file
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;

        let mut config: Config =
            toml::from_str(&contents).context("failed to parse TOML config")?;

        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.default_coins.is_empty() {
            self.default_coins = vec![
                "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT",
                "HYPEUSDT",
            ]
            .into_iter()
            .map(String::from)
            .collect();
        }

        if self.api_server_port == 0 {
            self.api_server_port = 8080;
        }

        if self.strategy.name.is_empty() {
            self.strategy.name = "sharpe_ratio".to_string();
        }
        if self.strategy.preference.is_empty() {
            self.strategy.preference = "balanced".to_string();
        }

        if self.api_server_config.rate_limit_rps == 0 {
            self.api_server_config.rate_limit_rps = 100;
        }
        if self.api_server_config.allowed_origins.is_empty() {
            self.api_server_config.allowed_origins = vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:5173".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ];
        }

        if self.analysis_mode.mode.is_empty() {
            self.analysis_mode.mode = "standard".to_string();
        }

        if self.analysis_mode.mode == "multi_timeframe" {
            let mt = self
                .analysis_mode
                .multi_timeframe
                .get_or_insert_with(MultiTimeframeConfig::default);

            let w = &mut mt.weights;
            if w.daily == 0.0
                && w.hourly4 == 0.0
                && w.hourly1 == 0.0
                && w.minute15 == 0.0
                && w.minute3 == 0.0
            {
                w.daily = 0.35;
                w.hourly4 = 0.25;
                w.hourly1 = 0.2;
                w.minute15 = 0.15;
                w.minute3 = 0.05;
            }

            if mt.min_consistency_score == 0.0 {
                mt.min_consistency_score = 0.5;
            }

            let ttl = &mut mt.cache_ttl;
            if ttl.daily == 0 {
                ttl.daily = 3600;
            }
            if ttl.hourly4 == 0 {
                ttl.hourly4 = 900;
            }
            if ttl.hourly1 == 0 {
                ttl.hourly1 = 300;
            }
            if ttl.minute15 == 0 {
                ttl.minute15 = 60;
            }
            if ttl.minute3 == 0 {
                ttl.minute3 = 30;
            }

            if mt.pullback_entry.bonus_score == 0.0 {
                mt.pullback_entry.bonus_score = 0.15;
            }
            mt.pullback_entry.bonus_score = mt.pullback_entry.bonus_score.clamp(0.0, 0.3);
        }
    }

    /// Validate configuration, rejecting values outside their legal ranges
    pub fn validate(&self) -> Result<()> {
        if self.traders.is_empty() {
            bail!("at least one trader must be configured");
        }

        let mut seen_ids = std::collections::HashSet::new();
        for (i, trader) in self.traders.iter().enumerate() {
            if trader.id.is_empty() {
                bail!("trader[{}]: id must not be empty", i);
            }
            if !seen_ids.insert(trader.id.clone()) {
                bail!("trader[{}]: duplicate id '{}'", i, trader.id);
            }
            if trader.name.is_empty() {
                bail!("trader[{}]: name must not be empty", i);
            }
            match trader.ai_model.as_str() {
                "qwen" | "deepseek" | "custom" => {}
                other => bail!(
                    "trader[{}]: ai_model must be 'qwen', 'deepseek' or 'custom', got '{}'",
                    i,
                    other
                ),
            }
            if !trader.exchange.is_empty() && trader.exchange != "aster" {
                bail!("trader[{}]: exchange must be 'aster'", i);
            }
            if trader.aster_user.is_empty()
                || trader.aster_signer.is_empty()
                || trader.aster_private_key.is_empty()
            {
                bail!(
                    "trader[{}]: aster_user, aster_signer and aster_private_key are required",
                    i
                );
            }
            if trader.scan_interval_minutes < 1 || trader.scan_interval_minutes > 60 {
                bail!("trader[{}]: scan_interval_minutes must be within 1-60", i);
            }
            if trader.initial_balance <= 0.0 {
                bail!("trader[{}]: initial_balance must be greater than 0", i);
            }
            if trader.ai_model == "qwen" && trader.qwen_key.is_empty() {
                bail!("trader[{}]: qwen_key is required for ai_model = 'qwen'", i);
            }
            if trader.ai_model == "deepseek" && trader.deepseek_key.is_empty() {
                bail!(
                    "trader[{}]: deepseek_key is required for ai_model = 'deepseek'",
                    i
                );
            }
            if trader.ai_model == "custom"
                && (trader.custom_api_url.is_empty()
                    || trader.custom_api_key.is_empty()
                    || trader.custom_model_name.is_empty())
            {
                bail!(
                    "trader[{}]: custom_api_url, custom_api_key and custom_model_name are required for ai_model = 'custom'",
                    i
                );
            }
        }

        if self.leverage.btc_eth_leverage == 0 || self.leverage.btc_eth_leverage > 125 {
            bail!("leverage.btc_eth_leverage must be within 1-125");
        }
        if self.leverage.altcoin_leverage == 0 || self.leverage.altcoin_leverage > 125 {
            bail!("leverage.altcoin_leverage must be within 1-125");
        }

        if !(0.0..=100.0).contains(&self.max_daily_loss) {
            bail!("max_daily_loss must be within 0-100 (percent)");
        }
        if !(0.0..=100.0).contains(&self.max_drawdown) {
            bail!("max_drawdown must be within 0-100 (percent)");
        }
        if !(0.0..=100.0).contains(&self.position_stop_loss_pct) {
            bail!("position_stop_loss_pct must be within 0-100 (percent)");
        }

        if self.api_server_config.rate_limit_rps > 10_000 {
            bail!("api_server_config.rate_limit_rps must not exceed 10000");
        }

        match self.analysis_mode.mode.as_str() {
            "standard" | "multi_timeframe" => {}
            other => bail!(
                "analysis_mode.mode must be 'standard' or 'multi_timeframe', got '{}'",
                other
            ),
        }

        if let Some(mt) = &self.analysis_mode.multi_timeframe {
            let sum = mt.weights.daily
                + mt.weights.hourly4
                + mt.weights.hourly1
                + mt.weights.minute15
                + mt.weights.minute3;
            if !(0.99..=1.01).contains(&sum) {
                bail!(
                    "multi_timeframe.weights must sum to 1.0, currently {:.2}",
                    sum
                );
            }
        }

        Ok(())
    }

    pub fn stop_trading_time(&self) -> Duration {
        Duration::from_secs(self.stop_trading_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
            max_daily_loss = 5.0
            max_drawdown = 10.0
            stop_trading_minutes = 60
            position_stop_loss_pct = 10.0

            [leverage]
            btc_eth_leverage = 10
            altcoin_leverage = 5

            [[traders]]
            id = "alpha"
            name = "Alpha"
            enabled = true
            ai_model = "deepseek"
            deepseek_key = "sk-test"
            aster_user = "0xuser"
            aster_signer = "0xsigner"
            aster_private_key = "0xkey"
            initial_balance = 10000.0
            scan_interval_minutes = 3
        "#
        .to_string()
    }

    fn parse(toml_str: &str) -> Result<Config> {
        let mut config: Config = toml::from_str(toml_str)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_parses() {
        let config = parse(&minimal_toml()).unwrap();
        assert_eq!(config.traders.len(), 1);
        assert_eq!(config.traders[0].id, "alpha");
        assert_eq!(config.api_server_port, 8080);
        assert_eq!(config.strategy.name, "sharpe_ratio");
        assert_eq!(config.default_coins[0], "BTCUSDT");
    }

    #[test]
    fn test_duplicate_trader_id_rejected() {
        let mut toml_str = minimal_toml();
        toml_str.push_str(
            r#"
            [[traders]]
            id = "alpha"
            name = "Alpha Two"
            ai_model = "deepseek"
            deepseek_key = "sk-test"
            aster_user = "0xuser"
            aster_signer = "0xsigner"
            aster_private_key = "0xkey"
            initial_balance = 5000.0
            scan_interval_minutes = 3
            "#,
        );
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn test_invalid_leverage_rejected() {
        let toml_str = minimal_toml().replace("btc_eth_leverage = 10", "btc_eth_leverage = 200");
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn test_multi_timeframe_defaults() {
        let mut toml_str = minimal_toml();
        toml_str.push_str(
            r#"
            [analysis_mode]
            mode = "multi_timeframe"
            "#,
        );
        let config = parse(&toml_str).unwrap();
        let mt = config.analysis_mode.multi_timeframe.unwrap();
        let sum = mt.weights.daily
            + mt.weights.hourly4
            + mt.weights.hourly1
            + mt.weights.minute15
            + mt.weights.minute3;
        assert!((sum - 1.0).abs() < 0.01);
        assert_eq!(mt.cache_ttl.daily, 3600);
        assert_eq!(mt.cache_ttl.minute3, 30);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut toml_str = minimal_toml();
        toml_str.push_str(
            r#"
            [analysis_mode]
            mode = "multi_timeframe"

            [analysis_mode.multi_timeframe.weights]
            daily = 0.5
            hourly4 = 0.3
            hourly1 = 0.3
            minute15 = 0.1
            minute3 = 0.1
            "#,
        );
        assert!(parse(&toml_str).is_err());
    }
}
