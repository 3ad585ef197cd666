//! Market data client
//!
//! Fetches K-lines, open interest and funding rate from the exchange's
//! public futures endpoints and derives the indicator set the decision
//! engine consumes. The default timeframe is 3 minutes with a deep history
//! so MACD/RSI have enough seed data.

pub mod indicators;

use crate::logger::{self, LogTag};
use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use std::sync::RwLock;
use std::time::Duration;

static BASE_API_URL: Lazy<RwLock<String>> =
    Lazy::new(|| RwLock::new("https://fapi.asterdex.com".to_string()));

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .expect("failed to build market http client")
});

/// Point the market data client at a different API base URL
pub fn set_base_url(url: &str) {
    let mut base = BASE_API_URL.write().unwrap();
    *base = url.trim_end_matches('/').to_string();
}

fn base_url() -> String {
    BASE_API_URL.read().unwrap().clone()
}

/// One K-line bar
#[derive(Debug, Clone, Copy, Default)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Open interest snapshot
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct OiData {
    pub latest: f64,
    pub average: f64,
}

/// Recent indicator series, oldest → latest, last 7 points
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IntradaySeries {
    pub mid_prices: Vec<f64>,
    pub volume: Vec<f64>,
    pub ema20: Vec<f64>,
    pub dif: Vec<f64>,
    pub dea: Vec<f64>,
    pub macd: Vec<f64>,
    pub rsi7: Vec<f64>,
    pub rsi14: Vec<f64>,
}

/// Assembled market view for one symbol on one timeframe
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Data {
    pub symbol: String,
    pub current_price: f64,
    pub price_change_1h: f64,
    pub price_change_4h: f64,
    pub current_ema20: f64,
    pub current_macd: f64,
    pub current_rsi7: f64,
    pub open_interest: Option<OiData>,
    pub funding_rate: f64,
    pub intraday_series: Option<IntradaySeries>,
}

/// Normalize a symbol to an upper-case USDT pair
pub fn normalize(symbol: &str) -> String {
    let symbol = symbol.trim().to_uppercase();
    if symbol.ends_with("USDT") {
        symbol
    } else {
        format!("{}USDT", symbol)
    }
}

/// Fetch market data on the default 3 m timeframe
pub async fn get(symbol: &str) -> Result<Data> {
    get_with_timeframe(symbol, "3m", 1000).await
}

/// Fetch market data for an explicit timeframe
pub async fn get_with_timeframe(symbol: &str, timeframe: &str, limit: usize) -> Result<Data> {
    let symbol = normalize(symbol);

    let klines = get_klines(&symbol, timeframe, limit)
        .await
        .with_context(|| format!("failed to fetch {} klines for {}", timeframe, symbol))?;
    if klines.is_empty() {
        bail!("kline request for {} returned an empty array", symbol);
    }

    let current_price = klines[klines.len() - 1].close;

    let nan_to_zero = |v: f64| if v.is_nan() { 0.0 } else { v };
    let current_ema20 = nan_to_zero(indicators::ema(&klines, 20));
    let current_macd = nan_to_zero(indicators::macd(&klines));
    let current_rsi7 = nan_to_zero(indicators::rsi(&klines, 7));

    let price_change_1h = price_change_over(&klines, klines_per_hours(timeframe, 1));
    let price_change_4h = price_change_over(&klines, klines_per_hours(timeframe, 4));

    let open_interest = match get_open_interest(&symbol).await {
        Ok(oi) => Some(oi),
        Err(e) => {
            logger::warning(
                LogTag::Market,
                &format!("open interest fetch failed for {}: {}", symbol, e),
            );
            Some(OiData::default())
        }
    };

    let funding_rate = match get_funding_rate(&symbol).await {
        Ok(rate) => rate,
        Err(e) => {
            logger::warning(
                LogTag::Market,
                &format!("funding rate fetch failed for {}: {}", symbol, e),
            );
            0.0
        }
    };

    Ok(Data {
        symbol,
        current_price,
        price_change_1h,
        price_change_4h,
        current_ema20,
        current_macd,
        current_rsi7,
        open_interest,
        funding_rate,
        intraday_series: Some(build_intraday_series(&klines)),
    })
}

/// How many bars of `timeframe` make up `hours` hours (0 = not derivable)
fn klines_per_hours(timeframe: &str, hours: usize) -> usize {
    let per_hour = match timeframe {
        "1m" => 60,
        "3m" => 20,
        "5m" => 12,
        "15m" => 4,
        "30m" => 2,
        "1h" => 1,
        "4h" => {
            return if hours == 4 { 1 } else { 0 };
        }
        "1d" => return 0,
        _ => return 0,
    };
    per_hour * hours
}

fn price_change_over(klines: &[Kline], bars: usize) -> f64 {
    if bars == 0 || klines.len() < bars + 1 {
        return 0.0;
    }
    let current = klines[klines.len() - 1].close;
    let past = klines[klines.len() - bars - 1].close;
    if past <= 0.0 {
        return 0.0;
    }
    ((current - past) / past) * 100.0
}

fn last_n(seq: Vec<f64>, n: usize) -> Vec<f64> {
    if seq.len() <= n {
        seq
    } else {
        seq[seq.len() - n..].to_vec()
    }
}

fn build_intraday_series(klines: &[Kline]) -> IntradaySeries {
    let start = klines.len().saturating_sub(7);
    let mid_prices = klines[start..].iter().map(|k| k.close).collect();
    let volume = klines[start..].iter().map(|k| k.volume).collect();

    let (dif, dea, hist) = indicators::macd_sequence(klines);

    IntradaySeries {
        mid_prices,
        volume,
        ema20: last_n(indicators::ema_sequence(klines, 20), 7),
        dif: last_n(dif, 7),
        dea: last_n(dea, 7),
        macd: last_n(hist, 7),
        rsi7: last_n(indicators::rsi_sequence(klines, 7), 7),
        rsi14: last_n(indicators::rsi_sequence(klines, 14), 7),
    }
}

async fn get_klines(symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
    let url = format!(
        "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
        base_url(),
        symbol,
        interval,
        limit
    );

    let response = HTTP.get(&url).send().await.context("kline request failed")?;
    let status = response.status();
    let body = response.text().await.context("failed to read kline response")?;

    if !status.is_success() {
        bail!("kline API error (status {}): {}", status, body);
    }

    let raw: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body)
        .map_err(|e| anyhow!("kline JSON parse failed: {} (body: {:.200})", e, body))?;

    let mut klines = Vec::with_capacity(raw.len());
    for (i, item) in raw.iter().enumerate() {
        if item.len() < 7 {
            bail!("kline row {} too short: {} fields", i, item.len());
        }
        klines.push(Kline {
            open_time: parse_number(&item[0])? as i64,
            open: parse_number(&item[1])?,
            high: parse_number(&item[2])?,
            low: parse_number(&item[3])?,
            close: parse_number(&item[4])?,
            volume: parse_number(&item[5])?,
            close_time: parse_number(&item[6])? as i64,
        });
    }
    Ok(klines)
}

async fn get_open_interest(symbol: &str) -> Result<OiData> {
    #[derive(serde::Deserialize)]
    struct OiResponse {
        #[serde(rename = "openInterest")]
        open_interest: String,
    }

    let url = format!("{}/fapi/v1/openInterest?symbol={}", base_url(), symbol);
    let response: OiResponse = HTTP
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let latest: f64 = response
        .open_interest
        .parse()
        .context("failed to parse openInterest")?;

    // Average needs historical OI; the latest value stands in until then
    Ok(OiData {
        latest,
        average: latest,
    })
}

async fn get_funding_rate(symbol: &str) -> Result<f64> {
    #[derive(serde::Deserialize)]
    struct PremiumIndex {
        #[serde(rename = "lastFundingRate")]
        last_funding_rate: String,
    }

    let url = format!("{}/fapi/v1/premiumIndex?symbol={}", base_url(), symbol);
    let response: PremiumIndex = HTTP
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    response
        .last_funding_rate
        .parse()
        .context("failed to parse lastFundingRate")
}

fn parse_number(value: &serde_json::Value) -> Result<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().map_err(|e| anyhow!("bad number '{}': {}", s, e)),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| anyhow!("number out of range: {}", n)),
        other => bail!("unsupported kline field type: {}", other),
    }
}

/// Render the market view the way prompts embed it
pub fn format_data(data: &Data) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "current_price = {:.2}, current_ema20 = {:.3}, current_macd = {:.3}, current_rsi (7 period) = {:.3}\n\n",
        data.current_price, data.current_ema20, data.current_macd, data.current_rsi7
    ));

    if let Some(oi) = &data.open_interest {
        out.push_str(&format!(
            "Open Interest: Latest: {:.2} Average: {:.2}\n\n",
            oi.latest, oi.average
        ));
    }
    out.push_str(&format!("Funding Rate: {:.2e}\n\n", data.funding_rate));

    if let Some(series) = &data.intraday_series {
        out.push_str("Intraday series (oldest to latest):\n\n");
        let fmt = |values: &[f64]| {
            let parts: Vec<String> = values.iter().map(|v| format!("{:.3}", v)).collect();
            format!("[{}]", parts.join(", "))
        };
        if !series.mid_prices.is_empty() {
            out.push_str(&format!("Mid prices: {}\n\n", fmt(&series.mid_prices)));
        }
        if !series.volume.is_empty() {
            out.push_str(&format!("Volume: {}\n\n", fmt(&series.volume)));
        }
        if !series.ema20.is_empty() {
            out.push_str(&format!("EMA indicators (20-period): {}\n\n", fmt(&series.ema20)));
        }
        if !series.dif.is_empty() {
            out.push_str(&format!("MACD DIF: {}\n\n", fmt(&series.dif)));
        }
        if !series.dea.is_empty() {
            out.push_str(&format!("MACD DEA: {}\n\n", fmt(&series.dea)));
        }
        if !series.macd.is_empty() {
            out.push_str(&format!("MACD HIST: {}\n\n", fmt(&series.macd)));
        }
        if !series.rsi7.is_empty() {
            out.push_str(&format!("RSI indicators (7-period): {}\n\n", fmt(&series.rsi7)));
        }
        if !series.rsi14.is_empty() {
            out.push_str(&format!("RSI indicators (14-period): {}\n\n", fmt(&series.rsi14)));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize("btc"), "BTCUSDT");
        assert_eq!(normalize("ETHUSDT"), "ETHUSDT");
        assert_eq!(normalize(" sol "), "SOLUSDT");
    }

    #[test]
    fn test_klines_per_hours() {
        assert_eq!(klines_per_hours("3m", 1), 20);
        assert_eq!(klines_per_hours("3m", 4), 80);
        assert_eq!(klines_per_hours("1h", 4), 4);
        assert_eq!(klines_per_hours("4h", 4), 1);
        assert_eq!(klines_per_hours("4h", 1), 0);
    }

    #[test]
    fn test_price_change_over() {
        let klines: Vec<Kline> = (0..30)
            .map(|i| Kline {
                close: 100.0 + i as f64,
                ..Default::default()
            })
            .collect();

        // 20 bars back: (129 − 109) / 109
        let change = price_change_over(&klines, 20);
        assert!((change - ((129.0 - 109.0) / 109.0 * 100.0)).abs() < 1e-9);

        // Not enough data
        assert_eq!(price_change_over(&klines, 40), 0.0);
    }

    #[test]
    fn test_parse_number_variants() {
        assert_eq!(parse_number(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(parse_number(&serde_json::json!(2)).unwrap(), 2.0);
        assert!(parse_number(&serde_json::json!(null)).is_err());
    }
}
