use anyhow::{bail, Context, Result};
use clap::Parser;
use perpbot::config::Config;
use perpbot::exchange::AsterClient;
use perpbot::llm::LlmClient;
use perpbot::logger::{self, LogTag};
use perpbot::storage::{CacheStore, StorageHub};
use perpbot::trader::{AutoTrader, AutoTraderConfig, TraderManager};
use perpbot::{api, pool, shutdown};
use std::sync::Arc;

/// AI-driven perpetual futures trading agent
#[derive(Parser, Debug)]
#[command(name = "perpbot", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Data directory for the SQLite stores
    #[arg(long, default_value = "data")]
    data_dir: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Append logs to this file in addition to the console
    #[arg(long)]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    logger::init(args.debug, args.verbose, args.log_file.clone());

    logger::info(LogTag::System, "🚀 perpbot starting up");

    if let Err(e) = run(args).await {
        logger::error(LogTag::System, &format!("fatal: {:#}", e));
        std::process::exit(1);
    }

    logger::info(LogTag::System, "✅ perpbot exited cleanly");
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;

    pool::configure(config.use_default_coins, &config.default_coins);

    let manager = Arc::new(TraderManager::new());

    for trader_config in config.traders.iter().filter(|t| t.enabled) {
        // One storage hub per trader keeps their tables apart
        let storage = Arc::new(
            StorageHub::new(&format!("{}/{}", args.data_dir, trader_config.id))
                .map_err(|e| anyhow::anyhow!("storage init failed for {}: {}", trader_config.id, e))?,
        );
        CacheStore::spawn_sweeper(storage.cache());

        let exchange = Arc::new(
            AsterClient::new(
                &trader_config.aster_user,
                &trader_config.aster_signer,
                &trader_config.aster_private_key,
            )
            .with_context(|| format!("exchange client init failed for {}", trader_config.id))?,
        );

        let llm = match trader_config.ai_model.as_str() {
            "deepseek" => LlmClient::deepseek(&trader_config.deepseek_key)?,
            "qwen" => LlmClient::qwen(&trader_config.qwen_key)?,
            "custom" => LlmClient::custom(
                &trader_config.custom_api_url,
                &trader_config.custom_api_key,
                &trader_config.custom_model_name,
            )?,
            other => bail!("unsupported ai_model '{}'", other),
        };
        logger::info(
            LogTag::System,
            &format!(
                "trader '{}' uses {} ({})",
                trader_config.name,
                llm.provider().as_str(),
                llm.model()
            ),
        );

        let auto_config = AutoTraderConfig {
            id: trader_config.id.clone(),
            name: trader_config.name.clone(),
            ai_model: trader_config.ai_model.clone(),
            exchange: if trader_config.exchange.is_empty() {
                "aster".to_string()
            } else {
                trader_config.exchange.clone()
            },
            scan_interval: trader_config.scan_interval(),
            initial_balance: trader_config.initial_balance,
            btc_eth_leverage: config.leverage.btc_eth_leverage,
            altcoin_leverage: config.leverage.altcoin_leverage,
            max_daily_loss: config.max_daily_loss,
            max_drawdown: config.max_drawdown,
            position_stop_loss_pct: config.position_stop_loss_pct,
            position_take_profit_pct: config.position_take_profit_pct,
            stop_trading_time: config.stop_trading_time(),
            skip_liquidity_check: config.skip_liquidity_check,
            analysis_mode: config.analysis_mode.mode.clone(),
            multi_timeframe: config.analysis_mode.multi_timeframe.clone(),
            strategy_name: config.strategy.name.clone(),
            strategy_preference: config.strategy.preference.clone(),
        };

        let trader = AutoTrader::new(auto_config, exchange, llm, storage)?;
        manager.add_trader(trader)?;
    }

    if manager.trader_ids().is_empty() {
        bail!("no enabled traders in the configuration");
    }

    manager.start_all();

    // Ctrl-C triggers a coordinated shutdown of every loop
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                logger::info(LogTag::System, "🛑 shutdown signal received");
                shutdown::request_shutdown();
                manager.stop_all();
            }
        });
    }

    api::start_server(
        Arc::clone(&manager),
        config.api_server_port,
        config.api_server_config.clone(),
    )
    .await
    .context("API server failed")?;

    Ok(())
}
