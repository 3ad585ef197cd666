//! Risk and execution constants

use std::time::Duration;

/// Maximum margin usage with positions across several symbols (%)
pub const MAX_MARGIN_USAGE_PCT: f64 = 90.0;
/// Maximum margin usage when everything rides on one symbol (%)
pub const MAX_MARGIN_USAGE_PCT_SINGLE_SYMBOL: f64 = 80.0;
/// Balance that must stay free after opening, as % of equity
pub const MIN_RESERVE_BALANCE_PCT: f64 = 5.0;
/// Minimum distance between entry and estimated liquidation price (%)
pub const MIN_SAFE_DISTANCE_PCT: f64 = 3.0;
/// Maintenance margin rate used for liquidation estimates
pub const MAINTENANCE_MARGIN_RATE: f64 = 0.01;

/// Cool-down before a failed force-close may be retried
pub const POSITION_STOP_LOSS_RETRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Minimum order notional in USDT
pub const MIN_POSITION_SIZE_USD: f64 = 0.001;

/// Watchdog cadence
pub const STOP_LOSS_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period after a market close before re-checking the position
pub const POST_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Pause between executed decisions within one cycle
pub const INTER_DECISION_PAUSE: Duration = Duration::from_secs(1);

/// Residual quantity below this is settlement noise, not a live position
pub const RESIDUAL_QUANTITY_EPSILON: f64 = 0.0001;

/// Relative price change under which update_sl / update_tp is skipped
pub const MIN_PRICE_UPDATE_RATIO: f64 = 0.005;
