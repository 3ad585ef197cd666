//! Account-level risk control
//!
//! `RiskGovernor` tracks peak equity and daily pnl under one mutex and
//! decides when the account must be flattened and paused. The margin and
//! balance safety check gates every open before it reaches the venue.

use super::constants::{
    MAINTENANCE_MARGIN_RATE, MAX_MARGIN_USAGE_PCT, MAX_MARGIN_USAGE_PCT_SINGLE_SYMBOL,
    MIN_RESERVE_BALANCE_PCT, MIN_SAFE_DISTANCE_PCT,
};
use crate::decision::{Context, Decision};
use crate::logger::{self, LogTag};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// Why the governor wants the account flattened
#[derive(Debug, Clone, PartialEq)]
pub enum HaltReason {
    MaxDrawdown { drawdown_pct: f64 },
    MaxDailyLoss { daily_loss_pct: f64 },
}

impl HaltReason {
    pub fn describe(&self) -> String {
        match self {
            HaltReason::MaxDrawdown { drawdown_pct } => {
                format!("account drawdown {:.2}% breached the limit", drawdown_pct)
            }
            HaltReason::MaxDailyLoss { daily_loss_pct } => {
                format!("daily loss {:.2}% breached the limit", daily_loss_pct)
            }
        }
    }
}

struct RiskState {
    daily_pnl: f64,
    daily_start_equity: f64,
    peak_equity: f64,
    last_reset_time: DateTime<Utc>,
    paused_until: Option<DateTime<Utc>>,
}

/// Peak-equity / daily-loss tracker with halt decisions
pub struct RiskGovernor {
    initial_balance: f64,
    max_drawdown_pct: f64,
    max_daily_loss_pct: f64,
    stop_trading_time: Duration,
    state: Mutex<RiskState>,
}

impl RiskGovernor {
    pub fn new(
        initial_balance: f64,
        max_drawdown_pct: f64,
        max_daily_loss_pct: f64,
        stop_trading_time: Duration,
    ) -> Self {
        Self {
            initial_balance,
            max_drawdown_pct,
            max_daily_loss_pct,
            stop_trading_time,
            state: Mutex::new(RiskState {
                daily_pnl: 0.0,
                // Seeded with the initial balance until the first daily reset
                daily_start_equity: initial_balance,
                peak_equity: initial_balance,
                last_reset_time: Utc::now(),
                paused_until: None,
            }),
        }
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    /// Remaining pause, if any
    pub fn pause_remaining(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        let until = state.paused_until?;
        let now = Utc::now();
        if until > now {
            (until - now).to_std().ok()
        } else {
            None
        }
    }

    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().paused_until
    }

    /// Is a daily reset due (24 h elapsed since the last one)?
    pub fn daily_reset_due(&self) -> bool {
        let state = self.state.lock().unwrap();
        Utc::now() - state.last_reset_time > chrono::Duration::hours(24)
    }

    /// Perform the daily rollover. Peak equity is never reset, only raised.
    pub fn daily_reset(&self, total_equity: f64) {
        let mut state = self.state.lock().unwrap();
        state.daily_start_equity = total_equity;
        state.daily_pnl = 0.0;
        if total_equity > state.peak_equity {
            state.peak_equity = total_equity;
        }
        state.last_reset_time = Utc::now();
        logger::info(
            LogTag::Risk,
            &format!(
                "daily pnl reset, day-start equity {:.2} USDT (peak {:.2})",
                state.daily_start_equity, state.peak_equity
            ),
        );
    }

    /// Fallback rollover when the account could not be read
    pub fn daily_reset_fallback(&self) {
        let mut state = self.state.lock().unwrap();
        state.daily_start_equity = self.initial_balance;
        state.daily_pnl = 0.0;
        state.peak_equity = state.peak_equity.max(self.initial_balance);
        state.last_reset_time = Utc::now();
    }

    /// Update tracking with the latest equity and check the halt conditions.
    /// On a breach, the pause window is armed and the reason returned; the
    /// caller is responsible for flattening positions.
    pub fn check(&self, total_equity: f64) -> Option<HaltReason> {
        let mut state = self.state.lock().unwrap();

        if total_equity > state.peak_equity {
            state.peak_equity = total_equity;
        }
        if Utc::now() - state.last_reset_time < chrono::Duration::hours(24) {
            state.daily_pnl = total_equity - state.daily_start_equity;
        }

        if self.max_drawdown_pct > 0.0 && state.peak_equity > 0.0 {
            let drawdown_pct =
                (state.peak_equity - total_equity) / state.peak_equity * 100.0;
            if drawdown_pct > self.max_drawdown_pct {
                state.paused_until =
                    Some(Utc::now() + chrono::Duration::from_std(self.stop_trading_time)
                        .unwrap_or_else(|_| chrono::Duration::zero()));
                return Some(HaltReason::MaxDrawdown { drawdown_pct });
            }
        }

        if self.max_daily_loss_pct > 0.0 && state.daily_start_equity > 0.0 {
            let daily_loss_pct = state.daily_pnl / state.daily_start_equity * 100.0;
            if daily_loss_pct < -self.max_daily_loss_pct {
                state.paused_until =
                    Some(Utc::now() + chrono::Duration::from_std(self.stop_trading_time)
                        .unwrap_or_else(|_| chrono::Duration::zero()));
                return Some(HaltReason::MaxDailyLoss {
                    daily_loss_pct: -daily_loss_pct,
                });
            }
        }

        None
    }

    pub fn daily_pnl(&self) -> f64 {
        self.state.lock().unwrap().daily_pnl
    }

    pub fn peak_equity(&self) -> f64 {
        self.state.lock().unwrap().peak_equity
    }

    pub fn last_reset_time(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().last_reset_time
    }
}

/// Pre-open margin, balance and liquidation-distance safety check.
///
/// `current_price` is the latest trade price; the quantity used here is the
/// unrounded one, rounding happens at submission.
pub fn check_margin_and_balance_safety(
    ctx: &Context,
    decision: &Decision,
    current_price: f64,
) -> Result<()> {
    if current_price <= 0.0 {
        bail!("current price is invalid: {:.4}", current_price);
    }

    let margin_required = decision.position_size_usd / decision.leverage as f64;

    let total_margin_after = ctx.account.margin_used + margin_required;
    let margin_pct_after = if ctx.account.total_equity > 0.0 {
        total_margin_after / ctx.account.total_equity * 100.0
    } else {
        0.0
    };

    let single_symbol = ctx.is_single_symbol(&decision.symbol);
    let max_margin_pct = if single_symbol {
        MAX_MARGIN_USAGE_PCT_SINGLE_SYMBOL
    } else {
        MAX_MARGIN_USAGE_PCT
    };

    if margin_pct_after > max_margin_pct {
        bail!(
            "margin usage after open would be {:.1}% > {:.0}% cap ({} mode)",
            margin_pct_after,
            max_margin_pct,
            if single_symbol { "single-symbol" } else { "multi-symbol" }
        );
    }

    let min_reserve = ctx.account.total_equity * MIN_RESERVE_BALANCE_PCT / 100.0;
    let available_after = ctx.account.available_balance - margin_required;
    if available_after < min_reserve {
        bail!(
            "insufficient balance: open needs {:.2} USDT margin, {:.2} would remain < {:.2} minimum reserve",
            margin_required,
            available_after,
            min_reserve
        );
    }

    // Estimated liquidation price must keep a safe distance from entry
    let margin_rate = 1.0 / decision.leverage as f64 + MAINTENANCE_MARGIN_RATE;
    let (liquidation_price, distance_pct) = if decision.action == "open_long" {
        let liq = current_price * (1.0 - margin_rate);
        (liq, (current_price - liq) / current_price * 100.0)
    } else {
        let liq = current_price * (1.0 + margin_rate);
        (liq, (liq - current_price) / current_price * 100.0)
    };

    if distance_pct < MIN_SAFE_DISTANCE_PCT {
        bail!(
            "estimated liquidation price {:.4} is only {:.2}% from entry {:.4} (< {:.1}% safe distance, leverage {}x too high)",
            liquidation_price,
            distance_pct,
            current_price,
            MIN_SAFE_DISTANCE_PCT,
            decision.leverage
        );
    }

    // A supplied stop loss must be strictly safer than the liquidation price
    if decision.stop_loss > 0.0 {
        if decision.action == "open_long" {
            if decision.stop_loss >= current_price {
                bail!(
                    "long stop loss {:.4} must be below entry {:.4}",
                    decision.stop_loss,
                    current_price
                );
            }
            if decision.stop_loss <= liquidation_price {
                bail!(
                    "stop loss {:.4} is at or beyond the estimated liquidation price {:.4}",
                    decision.stop_loss,
                    liquidation_price
                );
            }
        } else {
            if decision.stop_loss <= current_price {
                bail!(
                    "short stop loss {:.4} must be above entry {:.4}",
                    decision.stop_loss,
                    current_price
                );
            }
            if decision.stop_loss >= liquidation_price {
                bail!(
                    "stop loss {:.4} is at or beyond the estimated liquidation price {:.4}",
                    decision.stop_loss,
                    liquidation_price
                );
            }
        }
    }

    logger::debug(
        LogTag::Risk,
        &format!(
            "pre-open check passed: margin {:.1}% <= {:.0}%, liquidation distance {:.2}%",
            margin_pct_after, max_margin_pct, distance_pct
        ),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{AccountInfo, PositionInfo};

    fn ctx(equity: f64, available: f64, margin_used: f64) -> Context {
        Context {
            account: AccountInfo {
                total_equity: equity,
                available_balance: available,
                margin_used,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn open_long(size: f64, leverage: u32, stop: f64) -> Decision {
        Decision {
            symbol: "BTCUSDT".to_string(),
            action: "open_long".to_string(),
            leverage,
            position_size_usd: size,
            stop_loss: stop,
            take_profit: 62_000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_happy_path_open_passes() {
        let ctx = ctx(10_000.0, 9_000.0, 0.0);
        let decision = open_long(2_000.0, 10, 58_000.0);
        check_margin_and_balance_safety(&ctx, &decision, 60_000.0).unwrap();
    }

    #[test]
    fn test_liquidation_distance_rejection() {
        // 10x long: liquidation at 60000 * (1 - 0.1 - 0.01) = 53400, 11% away.
        // A stop at 59900 is fine distance-wise, but leverage 50x is not:
        // 60000 * (1 - 0.02 - 0.01) = 58200 -> 3% exactly is allowed, 100x is 2%.
        let ctx = ctx(10_000.0, 9_000.0, 0.0);
        let decision = open_long(2_000.0, 100, 0.0);
        let err = check_margin_and_balance_safety(&ctx, &decision, 60_000.0)
            .unwrap_err()
            .to_string();
        assert!(err.contains("liquidation"));
    }

    #[test]
    fn test_stop_loss_beyond_liquidation_rejected() {
        // 10x long: estimated liquidation 53400; stop below it is unsafe
        let ctx = ctx(10_000.0, 9_000.0, 0.0);
        let decision = open_long(2_000.0, 10, 53_000.0);
        let err = check_margin_and_balance_safety(&ctx, &decision, 60_000.0)
            .unwrap_err()
            .to_string();
        assert!(err.contains("liquidation"));
    }

    #[test]
    fn test_margin_cap_single_vs_multi() {
        // Single symbol (no positions): 80% cap
        let ctx_single = ctx(10_000.0, 10_000.0, 0.0);
        let decision = open_long(85_000.0, 10, 58_000.0); // 8500 margin = 85%
        assert!(check_margin_and_balance_safety(&ctx_single, &decision, 60_000.0).is_err());

        // Multi symbol: 90% cap allows the same open
        let mut ctx_multi = ctx(10_000.0, 10_000.0, 0.0);
        ctx_multi.positions.push(PositionInfo {
            symbol: "ETHUSDT".to_string(),
            ..Default::default()
        });
        // 8500 margin leaves 1500 > 500 reserve, and 85% < 90%
        check_margin_and_balance_safety(&ctx_multi, &decision, 60_000.0).unwrap();
    }

    #[test]
    fn test_reserve_balance_required() {
        // Margin fits the cap but would drain the 5% reserve
        let ctx = ctx(10_000.0, 2_100.0, 0.0);
        let decision = open_long(20_000.0, 10, 58_000.0); // 2000 margin, 100 left < 500
        let err = check_margin_and_balance_safety(&ctx, &decision, 60_000.0)
            .unwrap_err()
            .to_string();
        assert!(err.contains("reserve"));
    }

    #[test]
    fn test_governor_drawdown_halt() {
        let governor = RiskGovernor::new(10_000.0, 5.0, 0.0, Duration::from_secs(3600));

        // 7% drawdown from the 10000 peak
        match governor.check(9_300.0) {
            Some(HaltReason::MaxDrawdown { drawdown_pct }) => {
                assert!((drawdown_pct - 7.0).abs() < 1e-9);
            }
            other => panic!("expected drawdown halt, got {:?}", other),
        }
        assert!(governor.pause_remaining().is_some());
    }

    #[test]
    fn test_governor_daily_loss_boundary() {
        let governor = RiskGovernor::new(10_000.0, 0.0, 5.0, Duration::from_secs(3600));

        // 9500.01 is a 4.9999% loss: no halt
        assert!(governor.check(9_500.01).is_none());

        // 9499.99 is a 5.0001% loss: halt
        match governor.check(9_499.99) {
            Some(HaltReason::MaxDailyLoss { .. }) => {}
            other => panic!("expected daily loss halt, got {:?}", other),
        }
    }

    #[test]
    fn test_peak_equity_survives_daily_reset() {
        let governor = RiskGovernor::new(10_000.0, 0.0, 0.0, Duration::from_secs(0));

        governor.check(12_000.0);
        assert_eq!(governor.peak_equity(), 12_000.0);

        governor.daily_reset(11_000.0);
        assert_eq!(governor.peak_equity(), 12_000.0);
        assert_eq!(governor.daily_pnl(), 0.0);

        // Daily pnl now tracks against the new day-start equity
        governor.check(10_500.0);
        assert_eq!(governor.daily_pnl(), -500.0);
    }
}
