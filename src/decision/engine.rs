//! Decision engine: context → prompt → LLM → validated decisions
//!
//! The model is asked once per cycle with a system prompt (strategy rules +
//! dynamic position-sizing guidance) and a user prompt (account, positions
//! with their stored logic, candidate markets with indicator series). The
//! response is a chain-of-thought text followed by a JSON array which is
//! repaired for common quoting mistakes, parsed and validated before any
//! execution happens.

use super::analyzer::MultiTimeframeAnalyzer;
use super::strategy;
use super::types::{Context, Decision, FullDecision};
use crate::llm::LlmClient;
use crate::logger::{self, LogTag};
use crate::market;
use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use chrono::Utc;

/// Liquidity floor for new candidates: open interest value in USD millions
const MIN_OI_VALUE_MILLIONS: f64 = 15.0;

/// Run one full decision round against the model
pub async fn get_full_decision(ctx: &mut Context, llm: &LlmClient) -> Result<FullDecision> {
    fetch_market_data_for_context(ctx).await?;

    let user_prompt = build_user_prompt(ctx).await?;
    let is_single = ctx.positions.is_empty() || {
        let mut symbols: Vec<&str> = ctx.positions.iter().map(|p| p.symbol.as_str()).collect();
        symbols.sort();
        symbols.dedup();
        symbols.len() == 1
    };
    let system_prompt = build_system_prompt(
        ctx.account.total_equity,
        ctx.btc_eth_leverage,
        ctx.altcoin_leverage,
        is_single,
        &ctx.strategy_name,
    );

    let response = llm
        .call(&system_prompt, &user_prompt)
        .await
        .context("LLM call failed")?;

    let mut decision = parse_full_decision_response(&response, ctx).await?;
    decision.timestamp = Some(Utc::now());
    decision.user_prompt = user_prompt;
    Ok(decision)
}

/// True when a candidate clears the open-interest liquidity floor
pub fn passes_liquidity_floor(data: &market::Data) -> bool {
    let Some(oi) = &data.open_interest else {
        return false;
    };
    let oi_value_millions = oi.latest * data.current_price / 1_000_000.0;
    oi_value_millions >= MIN_OI_VALUE_MILLIONS
}

/// Populate `ctx.market_data_map` for positions and candidates.
///
/// Position symbols are always kept; new candidates are dropped when their
/// price is invalid or (unless configured off) their open-interest value is
/// below the liquidity floor.
pub async fn fetch_market_data_for_context(ctx: &mut Context) -> Result<()> {
    let mut symbols: Vec<String> = ctx.positions.iter().map(|p| p.symbol.clone()).collect();
    for coin in &ctx.candidate_coins {
        if !symbols.contains(&coin.symbol) {
            symbols.push(coin.symbol.clone());
        }
    }

    let position_symbols: std::collections::HashSet<String> =
        ctx.positions.iter().map(|p| p.symbol.clone()).collect();

    let mut kept = 0;
    let mut filtered = 0;
    let mut failed = 0;

    for symbol in symbols {
        let data = match market::get(&symbol).await {
            Ok(data) => data,
            Err(e) => {
                failed += 1;
                logger::warning(
                    LogTag::Market,
                    &format!("market data fetch failed for {}: {}", symbol, e),
                );
                continue;
            }
        };

        if !position_symbols.contains(&symbol) {
            if data.current_price <= 0.0 {
                filtered += 1;
                logger::warning(
                    LogTag::Market,
                    &format!("{} filtered: invalid price {:.4}", symbol, data.current_price),
                );
                continue;
            }
            if !ctx.skip_liquidity_check && !passes_liquidity_floor(&data) {
                filtered += 1;
                let oi_millions = data
                    .open_interest
                    .as_ref()
                    .map(|oi| oi.latest * data.current_price / 1_000_000.0)
                    .unwrap_or(0.0);
                logger::info(
                    LogTag::Market,
                    &format!(
                        "{} filtered: OI value {:.2}M USD below {:.0}M floor",
                        symbol, oi_millions, MIN_OI_VALUE_MILLIONS
                    ),
                );
                continue;
            }
        }

        ctx.market_data_map.insert(symbol, data);
        kept += 1;
    }

    logger::info(
        LogTag::Market,
        &format!(
            "market data ready: {} kept, {} filtered, {} failed",
            kept, filtered, failed
        ),
    );
    Ok(())
}

/// System prompt: strategy text + dynamic sizing rules
pub fn build_system_prompt(
    account_equity: f64,
    btc_eth_leverage: u32,
    altcoin_leverage: u32,
    is_single_symbol: bool,
    strategy_name: &str,
) -> String {
    let mut prompt = strategy::strategy_prompt_or_default(strategy_name);
    prompt.push_str("\n\n# Position sizing (dynamic)\n\n");

    if is_single_symbol {
        prompt.push_str(&format!(
            "Single-symbol mode: target around 50% margin usage.\n\
             - BTC/ETH suggested size: {:.0} USDT (equity {:.0} x 0.5 x {}x)\n\
             - Altcoin suggested size: {:.0} USDT (equity {:.0} x 0.5 x {}x)\n\
             - Margin usage must stay at or below 50% in this mode.\n",
            account_equity * 0.5 * btc_eth_leverage as f64,
            account_equity,
            btc_eth_leverage,
            account_equity * 0.5 * altcoin_leverage as f64,
            account_equity,
            altcoin_leverage,
        ));
    } else {
        prompt.push_str(&format!(
            "Multi-symbol mode:\n\
             - BTC/ETH position value hard cap: {:.0} USDT ({}x leverage x 0.9 of equity)\n\
             - Altcoin position value hard cap: {:.0} USDT ({}x leverage x 0.9 of equity)\n\
             - Total margin usage must stay at or below 90%.\n",
            account_equity * btc_eth_leverage as f64 * 0.9,
            btc_eth_leverage,
            account_equity * altcoin_leverage as f64 * 0.9,
            altcoin_leverage,
        ));
    }

    prompt
}

/// User prompt: cycle header, account, positions with logic, candidates
/// with per-timeframe series, performance data and recent forced closes
pub async fn build_user_prompt(ctx: &Context) -> Result<String> {
    let analyzer = MultiTimeframeAnalyzer::new(ctx.multi_timeframe_config.clone());
    let analysis = analyzer.analyze(ctx).await?;

    let mut out = String::new();

    out.push_str(&format!(
        "**Time**: {} | **Cycle**: #{} | **Runtime**: {} min | **Mode**: multi-timeframe\n\n",
        ctx.current_time, ctx.call_count, ctx.runtime_minutes
    ));

    let available_pct = if ctx.account.total_equity > 0.0 {
        ctx.account.available_balance / ctx.account.total_equity * 100.0
    } else {
        0.0
    };
    out.push_str(&format!(
        "**Account**: equity {:.2} | available {:.2} ({:.1}%) | pnl {:.2} ({:.2}%) | margin {:.1}% | {} positions\n\n",
        ctx.account.total_equity,
        ctx.account.available_balance,
        available_pct,
        ctx.account.total_pnl,
        ctx.account.total_pnl_pct,
        ctx.account.margin_used_pct,
        ctx.account.position_count,
    ));

    if ctx.positions.is_empty() {
        out.push_str("**Open positions**: none\n\n");
    } else {
        out.push_str("## Open positions\n\n");
        for (i, pos) in ctx.positions.iter().enumerate() {
            let holding = if pos.update_time > 0 {
                let minutes = (Utc::now().timestamp_millis() - pos.update_time) / 60_000;
                if minutes < 60 {
                    format!(" | held {} min", minutes)
                } else {
                    format!(" | held {}h {}min", minutes / 60, minutes % 60)
                }
            } else {
                String::new()
            };

            out.push_str(&format!(
                "{}. {} {} | entry {:.4} mark {:.4} | {}x | pnl {:.2} ({:.2}%) | margin {:.0} | liq {:.4}{}\n",
                i + 1,
                pos.symbol,
                pos.side.to_uppercase(),
                pos.entry_price,
                pos.mark_price,
                pos.leverage,
                pos.unrealized_pnl,
                pos.unrealized_pnl_pct,
                pos.margin_used,
                pos.liquidation_price,
                holding,
            ));

            if pos.stop_loss > 0.0 {
                out.push_str(&format!("   stop loss: {:.4}\n", pos.stop_loss));
            } else {
                out.push_str("   stop loss: not set\n");
            }
            if pos.take_profit > 0.0 {
                out.push_str(&format!("   take profit: {:.4}\n", pos.take_profit));
            } else {
                out.push_str("   take profit: not set\n");
            }

            if let Some(entry) = &pos.entry_logic {
                out.push_str(&format!("   entry logic: {}\n", entry.reasoning));
                if let Some(mtf) = &entry.multi_timeframe {
                    if !mtf.major_trend.is_empty() {
                        out.push_str(&format!("   entry major trend: {}\n", mtf.major_trend));
                    }
                }
            } else {
                out.push_str("   entry logic: not recorded\n");
            }
            if let Some(exit) = &pos.exit_logic {
                out.push_str(&format!("   exit plan: {}\n", exit.reasoning));
            } else {
                out.push_str("   exit plan: not recorded (consider planning one)\n");
            }
            if pos.logic_invalid {
                out.push_str(&format!(
                    "   logic check: INVALID ({})\n",
                    pos.invalid_reasons.join("; ")
                ));
            }
            out.push('\n');
        }
    }

    out.push_str(&format!(
        "## Candidate markets ({} total, ordered by multi-timeframe score)\n\n",
        analysis.sorted_symbols.len()
    ));
    for (i, symbol) in analysis.sorted_symbols.iter().enumerate() {
        out.push_str(&format!("### {}. {}\n\n", i + 1, symbol));
        out.push_str(&format!("Leverage cap: {}\n\n", ctx.leverage_for(symbol)));

        if let Some(frames) = analysis.timeframe_data.get(symbol) {
            for (label, data) in frames {
                out.push_str(&format!("**{} data**:\n", label));
                out.push_str(&indent(&market::format_data(data)));
                out.push('\n');
            }
        } else if let Some(data) = ctx.market_data_map.get(symbol) {
            out.push_str(&indent(&market::format_data(data)));
            out.push('\n');
        }
    }

    if let Some(perf) = &ctx.performance {
        out.push_str("## Historical performance\n\n");
        if perf.total_trades > 0 {
            out.push_str(&format!(
                "- Total trades: {} (win rate {:.1}%)\n- Avg win: {:.2} USDT | Avg loss: {:.2} USDT\n- Profit factor: {:.2} | Sharpe: {:.2}\n\n",
                perf.total_trades, perf.win_rate, perf.avg_win, perf.avg_loss, perf.profit_factor, perf.sharpe_ratio
            ));

            if !perf.recent_trades.is_empty() {
                out.push_str("Recent trades (latest first):\n");
                for (i, trade) in perf.recent_trades.iter().take(5).enumerate() {
                    out.push_str(&format!(
                        "{}. {} {} | {:.2} -> {:.2} | pnl {:+.2} USDT ({:.2}%) | {}x | {}{}\n",
                        i + 1,
                        trade.symbol,
                        trade.side,
                        trade.open_price,
                        trade.close_price,
                        trade.pnl,
                        trade.pnl_pct,
                        trade.leverage,
                        trade.close_reason,
                        if trade.was_stop_loss { " [stop loss]" } else { "" },
                    ));
                }
                out.push('\n');
            }
        } else {
            out.push_str("- No completed trades yet\n\n");
        }
    }

    if !ctx.recent_forced_closes.is_empty() {
        out.push_str("## Recent forced closes\n\n");
        for (i, line) in ctx.recent_forced_closes.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, line));
        }
        out.push('\n');
    }

    out.push_str("---\n\nRespond with your chain-of-thought analysis followed by a JSON array of decisions.\n");
    Ok(out)
}

fn indent(text: &str) -> String {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| format!("   {}\n", line))
        .collect()
}

/// Parse the model response into a FullDecision
pub async fn parse_full_decision_response(response: &str, ctx: &Context) -> Result<FullDecision> {
    let cot_trace = extract_cot_trace(response);

    let decisions = match extract_decisions(response) {
        Ok(decisions) => decisions,
        Err(e) => {
            return Err(anyhow!(
                "failed to extract decisions: {}\n\n=== chain of thought ===\n{}",
                e,
                cot_trace
            ));
        }
    };

    if let Err(e) = validate_decisions(&decisions, ctx).await {
        return Err(anyhow!(
            "decision validation failed: {}\n\n=== chain of thought ===\n{}",
            e,
            cot_trace
        ));
    }

    Ok(FullDecision {
        user_prompt: String::new(),
        cot_trace,
        decisions,
        timestamp: None,
    })
}

/// Text before the first JSON array is the chain-of-thought
pub fn extract_cot_trace(response: &str) -> String {
    match response.find('[') {
        Some(idx) if idx > 0 => response[..idx].trim().to_string(),
        _ => response.trim().to_string(),
    }
}

/// Extract and parse the first complete JSON array in the response
pub fn extract_decisions(response: &str) -> Result<Vec<Decision>> {
    let start = response
        .find('[')
        .ok_or_else(|| anyhow!("no JSON array start found"))?;
    let end = find_matching_bracket(response, start)
        .ok_or_else(|| anyhow!("no matching JSON array end found"))?;

    let json = fix_smart_quotes(response[start..=end].trim());

    serde_json::from_str(&json)
        .map_err(|e| anyhow!("JSON parse failed: {} (content: {:.400})", e, json))
}

/// Replace typographic quotes that models occasionally emit
fn fix_smart_quotes(json: &str) -> String {
    json.replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'")
}

fn find_matching_bracket(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    if bytes.get(start) != Some(&b'[') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate every decision against the current context
pub async fn validate_decisions(decisions: &[Decision], ctx: &Context) -> Result<()> {
    for (i, decision) in decisions.iter().enumerate() {
        validate_decision(decision, ctx)
            .await
            .with_context(|| format!("decision #{} rejected", i + 1))?;
    }
    Ok(())
}

async fn current_price_for(ctx: &Context, symbol: &str) -> Result<f64> {
    if let Some(data) = ctx.market_data_map.get(symbol) {
        if data.current_price > 0.0 {
            return Ok(data.current_price);
        }
    }

    let data = market::get(symbol)
        .await
        .with_context(|| format!("failed to fetch current price for {}", symbol))?;
    if data.current_price <= 0.0 {
        bail!("current price for {} is invalid: {:.4}", symbol, data.current_price);
    }
    Ok(data.current_price)
}

async fn validate_decision(decision: &Decision, ctx: &Context) -> Result<()> {
    const VALID_ACTIONS: [&str; 8] = [
        "open_long",
        "open_short",
        "close_long",
        "close_short",
        "update_tp",
        "update_sl",
        "hold",
        "wait",
    ];
    if !VALID_ACTIONS.contains(&decision.action.as_str()) {
        bail!("unknown action: {}", decision.action);
    }

    if decision.is_open() {
        let max_leverage = ctx.leverage_for(&decision.symbol);
        if decision.leverage == 0 || decision.leverage > max_leverage {
            bail!(
                "leverage must be within 1-{} for {}, got {}",
                max_leverage,
                decision.symbol,
                decision.leverage
            );
        }
        if decision.position_size_usd <= 0.0 {
            bail!("position size must be greater than 0: {:.2}", decision.position_size_usd);
        }

        // Margin bound: 80% of equity when trading one symbol, 90% otherwise
        let margin_required = decision.position_size_usd / decision.leverage as f64;
        let max_margin_pct = if ctx.is_single_symbol(&decision.symbol) {
            80.0
        } else {
            90.0
        };
        let max_margin_allowed = ctx.account.total_equity * max_margin_pct / 100.0;
        if margin_required > max_margin_allowed * 1.01 {
            bail!(
                "margin {:.0} USDT exceeds {:.0}% cap ({:.0} USDT) for {}",
                margin_required,
                max_margin_pct,
                max_margin_allowed,
                decision.symbol
            );
        }

        // Second line of defense: position value cap at 0.9x leveraged equity
        let max_position_value =
            ctx.account.total_equity * max_leverage as f64 * 0.9;
        if decision.position_size_usd > max_position_value * 1.01 {
            bail!(
                "position value {:.0} USDT exceeds cap {:.0} USDT for {}",
                decision.position_size_usd,
                max_position_value,
                decision.symbol
            );
        }

        if decision.stop_loss <= 0.0 || decision.take_profit <= 0.0 {
            bail!("stop loss and take profit are required for opens");
        }
        if decision.action == "open_long" && decision.stop_loss >= decision.take_profit {
            bail!("long stop loss must be below take profit");
        }
        if decision.action == "open_short" && decision.stop_loss <= decision.take_profit {
            bail!("short stop loss must be above take profit");
        }

        // Current price must sit strictly between the two exits
        let price = current_price_for(ctx, &decision.symbol).await?;
        let in_range = if decision.action == "open_long" {
            price > decision.stop_loss && price < decision.take_profit
        } else {
            price > decision.take_profit && price < decision.stop_loss
        };
        if !in_range {
            bail!(
                "current price {:.4} is outside the stop {:.4} / take {:.4} range for {}",
                price,
                decision.stop_loss,
                decision.take_profit,
                decision.action
            );
        }
    }

    if decision.action == "update_tp" {
        if decision.take_profit <= 0.0 {
            bail!("update_tp requires a valid take_profit price: {:.4}", decision.take_profit);
        }
        if decision.symbol.is_empty() {
            bail!("update_tp requires a symbol");
        }
    }
    if decision.action == "update_sl" {
        if decision.stop_loss <= 0.0 {
            bail!("update_sl requires a valid stop_loss price: {:.4}", decision.stop_loss);
        }
        if decision.symbol.is_empty() {
            bail!("update_sl requires a symbol");
        }
    }

    Ok(())
}

/// Closes execute before opens, opens before hold/wait
pub fn sort_decisions_by_priority(decisions: Vec<Decision>) -> Vec<Decision> {
    let priority = |action: &str| -> u32 {
        match action {
            "close_long" | "close_short" => 1,
            "open_long" | "open_short" => 2,
            "update_sl" | "update_tp" => 3,
            "hold" | "wait" => 4,
            _ => 999,
        }
    };

    let mut sorted = decisions;
    sorted.sort_by_key(|d| priority(&d.action));
    sorted
}

/// For update_sl / update_tp on the same symbol, keep only the last
/// occurrence; everything else passes through untouched.
pub fn deduplicate_decisions(decisions: Vec<Decision>) -> Vec<Decision> {
    if decisions.len() <= 1 {
        return decisions;
    }

    let dedup_action = |action: &str| action == "update_sl" || action == "update_tp";

    let mut last_index = std::collections::HashMap::new();
    for (i, decision) in decisions.iter().enumerate() {
        if dedup_action(&decision.action) {
            last_index.insert(format!("{}_{}", decision.symbol, decision.action), i);
        }
    }

    decisions
        .into_iter()
        .enumerate()
        .filter(|(i, decision)| {
            if !dedup_action(&decision.action) {
                return true;
            }
            let key = format!("{}_{}", decision.symbol, decision.action);
            last_index.get(&key) == Some(i)
        })
        .map(|(_, decision)| decision)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Data, OiData};

    fn ctx_with_price(symbol: &str, price: f64) -> Context {
        let mut ctx = Context {
            btc_eth_leverage: 10,
            altcoin_leverage: 5,
            ..Default::default()
        };
        ctx.account.total_equity = 10_000.0;
        ctx.market_data_map.insert(
            symbol.to_string(),
            Data {
                symbol: symbol.to_string(),
                current_price: price,
                ..Default::default()
            },
        );
        ctx
    }

    fn open_long(symbol: &str) -> Decision {
        Decision {
            symbol: symbol.to_string(),
            action: "open_long".to_string(),
            leverage: 10,
            position_size_usd: 2_000.0,
            stop_loss: 58_000.0,
            take_profit: 62_000.0,
            reasoning: "r".to_string(),
            exit_reasoning: "e".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cot_extraction() {
        let response = "I think BTC looks strong here.\n[{\"symbol\": \"BTCUSDT\"}]";
        assert_eq!(extract_cot_trace(response), "I think BTC looks strong here.");

        let no_json = "nothing actionable this cycle";
        assert_eq!(extract_cot_trace(no_json), no_json);
    }

    #[test]
    fn test_extract_decisions_with_bracket_matching() {
        let response = r#"Analysis: nested [brackets] in text are ignored once JSON starts.
[
  {"symbol": "BTCUSDT", "action": "open_long", "leverage": 10,
   "position_size_usd": 2000, "stop_loss": 58000, "take_profit": 62000,
   "reasoning": "breakout [4h]"}
]"#;
        // The CoT contains brackets before the array; extraction starts there,
        // so point the parser at a response whose first bracket is the array.
        let response = &response[response.find("\n[").unwrap() + 1..];
        let decisions = extract_decisions(response).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "BTCUSDT");
        assert_eq!(decisions[0].reasoning, "breakout [4h]");
    }

    #[test]
    fn test_smart_quote_repair() {
        let response = "[{\u{201c}symbol\u{201d}: \u{201c}BTCUSDT\u{201d}, \u{201c}action\u{201d}: \u{201c}hold\u{201d}}]";
        let decisions = extract_decisions(response).unwrap();
        assert_eq!(decisions[0].action, "hold");
    }

    #[test]
    fn test_extract_decisions_missing_array() {
        assert!(extract_decisions("no json here").is_err());
        assert!(extract_decisions("[ unterminated").is_err());
    }

    #[tokio::test]
    async fn test_validate_accepts_good_open() {
        let ctx = ctx_with_price("BTCUSDT", 60_000.0);
        validate_decisions(&[open_long("BTCUSDT")], &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_rejects_price_outside_range() {
        let ctx = ctx_with_price("BTCUSDT", 57_000.0); // below the stop
        let err = validate_decisions(&[open_long("BTCUSDT")], &ctx)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("rejected"));
    }

    #[tokio::test]
    async fn test_validate_rejects_excess_leverage() {
        let ctx = ctx_with_price("SOLUSDT", 100.0);
        let mut decision = open_long("SOLUSDT");
        decision.leverage = 10; // altcoin cap is 5
        decision.stop_loss = 95.0;
        decision.take_profit = 110.0;
        assert!(validate_decisions(&[decision], &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_inverted_long_exits() {
        let ctx = ctx_with_price("BTCUSDT", 60_000.0);
        let mut decision = open_long("BTCUSDT");
        decision.stop_loss = 62_000.0;
        decision.take_profit = 58_000.0;
        assert!(validate_decisions(&[decision], &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_margin_cap_single_symbol() {
        // Single symbol: margin cap is 80% of 10k = 8000
        let ctx = ctx_with_price("BTCUSDT", 60_000.0);
        let mut decision = open_long("BTCUSDT");
        decision.position_size_usd = 85_000.0; // 8500 margin at 10x
        assert!(validate_decisions(&[decision.clone()], &ctx).await.is_err());

        decision.position_size_usd = 78_000.0; // 7800 margin at 10x
        validate_decisions(&[decision], &ctx).await.unwrap();
    }

    #[test]
    fn test_sort_closes_before_opens() {
        let decisions = vec![
            Decision {
                action: "open_long".to_string(),
                symbol: "A".to_string(),
                ..Default::default()
            },
            Decision {
                action: "hold".to_string(),
                symbol: "B".to_string(),
                ..Default::default()
            },
            Decision {
                action: "close_short".to_string(),
                symbol: "C".to_string(),
                ..Default::default()
            },
        ];

        let sorted = sort_decisions_by_priority(decisions);
        assert_eq!(sorted[0].action, "close_short");
        assert_eq!(sorted[1].action, "open_long");
        assert_eq!(sorted[2].action, "hold");
    }

    #[test]
    fn test_dedupe_keeps_last_update() {
        let decisions = vec![
            Decision {
                action: "update_sl".to_string(),
                symbol: "BTCUSDT".to_string(),
                stop_loss: 58_000.0,
                ..Default::default()
            },
            Decision {
                action: "open_long".to_string(),
                symbol: "ETHUSDT".to_string(),
                ..Default::default()
            },
            Decision {
                action: "update_sl".to_string(),
                symbol: "BTCUSDT".to_string(),
                stop_loss: 58_500.0,
                ..Default::default()
            },
        ];

        let deduped = deduplicate_decisions(decisions);
        assert_eq!(deduped.len(), 2);
        let sl: Vec<&Decision> = deduped.iter().filter(|d| d.action == "update_sl").collect();
        assert_eq!(sl.len(), 1);
        assert_eq!(sl[0].stop_loss, 58_500.0);
    }

    #[test]
    fn test_dedupe_is_per_update_type() {
        let decisions = vec![
            Decision {
                action: "update_sl".to_string(),
                symbol: "BTCUSDT".to_string(),
                ..Default::default()
            },
            Decision {
                action: "update_tp".to_string(),
                symbol: "BTCUSDT".to_string(),
                ..Default::default()
            },
        ];
        assert_eq!(deduplicate_decisions(decisions).len(), 2);
    }

    #[test]
    fn test_liquidity_floor_boundary() {
        let mut data = Data {
            current_price: 1.0,
            open_interest: Some(OiData {
                latest: 14_999_000.0,
                average: 0.0,
            }),
            ..Default::default()
        };
        assert!(!passes_liquidity_floor(&data));

        data.open_interest = Some(OiData {
            latest: 15_001_000.0,
            average: 0.0,
        });
        assert!(passes_liquidity_floor(&data));
    }
}
