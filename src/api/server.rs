//! Axum read API
//!
//! GET-only JSON endpoints over the trader manager plus a per-IP fixed
//! window rate limiter. Stored decision records are served verbatim; the
//! equity history is derived from them in ascending time order.

use crate::config::ApiServerConfig;
use crate::logger::{self, LogTag};
use crate::shutdown;
use crate::trader::TraderManager;
use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;

const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const RATE_LIMIT_MAX_IDLE: Duration = Duration::from_secs(30 * 60);

/// Fixed-window (1 s) per-IP request limiter
pub struct RateLimiter {
    rps: u32,
    entries: Mutex<HashMap<IpAddr, RateLimitEntry>>,
}

struct RateLimitEntry {
    count: u32,
    window_start: Instant,
    last_access: Instant,
}

impl RateLimiter {
    pub fn new(rps: u32) -> Self {
        Self {
            rps,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True when the request is allowed
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(ip).or_insert(RateLimitEntry {
            count: 0,
            window_start: now,
            last_access: now,
        });

        entry.last_access = now;
        if now.duration_since(entry.window_start) >= Duration::from_secs(1) {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.rps {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Drop entries idle for longer than the cutoff
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| now.duration_since(entry.last_access) <= RATE_LIMIT_MAX_IDLE);
    }

    pub fn tracked_ips(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

pub struct ApiState {
    pub manager: Arc<TraderManager>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

#[derive(Deserialize, Default)]
struct TraderQuery {
    trader_id: Option<String>,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Resolve the target trader: explicit id, or the first registered one
fn resolve_trader(
    state: &ApiState,
    query: &TraderQuery,
) -> Result<Arc<crate::trader::AutoTrader>, Response> {
    let trader_id = match &query.trader_id {
        Some(id) => id.clone(),
        None => state
            .manager
            .trader_ids()
            .into_iter()
            .next()
            .ok_or_else(|| {
                error_response(StatusCode::BAD_REQUEST, "no traders available".to_string())
            })?,
    };

    state.manager.get_trader(&trader_id).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            format!("trader '{}' not found", trader_id),
        )
    })
}

async fn rate_limit_middleware(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.check(addr.ip()) {
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "too many requests, slow down".to_string(),
            );
        }
    }
    next.run(request).await
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339(),
    }))
}

async fn handle_traders(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let traders: Vec<serde_json::Value> = state
        .manager
        .all_traders()
        .iter()
        .map(|t| {
            serde_json::json!({
                "trader_id": t.id(),
                "trader_name": t.name(),
                "ai_model": t.ai_model(),
            })
        })
        .collect();
    Json(serde_json::Value::Array(traders))
}

async fn handle_competition(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(state.manager.comparison_data().await)
}

async fn handle_status(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TraderQuery>,
) -> Response {
    match resolve_trader(&state, &query) {
        Ok(trader) => Json(trader.get_status()).into_response(),
        Err(response) => response,
    }
}

async fn handle_account(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TraderQuery>,
) -> Response {
    let trader = match resolve_trader(&state, &query) {
        Ok(trader) => trader,
        Err(response) => return response,
    };

    match trader.get_account_info().await {
        Ok(account) => Json(account).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to fetch account info: {}", e),
        ),
    }
}

async fn handle_positions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TraderQuery>,
) -> Response {
    let trader = match resolve_trader(&state, &query) {
        Ok(trader) => trader,
        Err(response) => return response,
    };

    match trader.get_positions_view().await {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to fetch positions: {}", e),
        ),
    }
}

async fn handle_decisions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TraderQuery>,
) -> Response {
    let trader = match resolve_trader(&state, &query) {
        Ok(trader) => trader,
        Err(response) => return response,
    };

    match trader.get_decision_records(10_000) {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to fetch decision records: {}", e),
        ),
    }
}

async fn handle_latest_decisions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TraderQuery>,
) -> Response {
    let trader = match resolve_trader(&state, &query) {
        Ok(trader) => trader,
        Err(response) => return response,
    };

    match trader.get_decision_records(5) {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to fetch decision records: {}", e),
        ),
    }
}

async fn handle_statistics(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TraderQuery>,
) -> Response {
    let trader = match resolve_trader(&state, &query) {
        Ok(trader) => trader,
        Err(response) => return response,
    };

    let records = match trader.get_decision_records(10_000) {
        Ok(records) => records,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to fetch decision records: {}", e),
            )
        }
    };

    let mut successful = 0usize;
    let mut failed = 0usize;
    let mut opens = 0usize;
    let mut closes = 0usize;
    for record in &records {
        if record.success {
            successful += 1;
        } else {
            failed += 1;
        }
        if let Some(actions) = record.decisions.as_array() {
            for action in actions {
                if action.get("success").and_then(|v| v.as_bool()) != Some(true) {
                    continue;
                }
                match action.get("action").and_then(|v| v.as_str()) {
                    Some("open_long") | Some("open_short") => opens += 1,
                    Some("close_long") | Some("close_short") => closes += 1,
                    _ => {}
                }
            }
        }
    }

    Json(serde_json::json!({
        "total_cycles": records.len(),
        "successful_cycles": successful,
        "failed_cycles": failed,
        "total_open_positions": opens,
        "total_close_positions": closes,
    }))
    .into_response()
}

async fn handle_equity_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TraderQuery>,
) -> Response {
    let trader = match resolve_trader(&state, &query) {
        Ok(trader) => trader,
        Err(response) => return response,
    };

    let records = match trader.get_decision_records(10_000) {
        Ok(records) => records,
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to fetch decision records: {}", e),
            )
        }
    };

    let initial_balance = trader.initial_balance();
    let mut history: Vec<serde_json::Value> = records
        .iter()
        .map(|record| {
            let total_equity = record
                .account_state
                .get("total_balance")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let mut total_pnl = record
                .account_state
                .get("total_unrealized_profit")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            if total_pnl == 0.0 {
                total_pnl = total_equity - initial_balance;
            }
            let total_pnl_pct = if initial_balance > 0.0 {
                total_pnl / initial_balance * 100.0
            } else {
                0.0
            };

            serde_json::json!({
                "timestamp": record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                "timestamp_ms": record.timestamp.timestamp_millis(),
                "total_equity": total_equity,
                "available_balance": record.account_state.get("available_balance").and_then(|v| v.as_f64()).unwrap_or(0.0),
                "total_pnl": total_pnl,
                "total_pnl_pct": total_pnl_pct,
                "initial_balance": initial_balance,
                "position_count": record.account_state.get("position_count").and_then(|v| v.as_u64()).unwrap_or(0),
                "margin_used_pct": record.account_state.get("margin_used_pct").and_then(|v| v.as_f64()).unwrap_or(0.0),
                "cycle_number": record.cycle_number,
            })
        })
        .collect();

    // Records come newest first; history is served time-ascending
    history.sort_by_key(|point| {
        point
            .get("timestamp_ms")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    });

    Json(serde_json::Value::Array(history)).into_response()
}

async fn handle_performance(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TraderQuery>,
) -> Response {
    let trader = match resolve_trader(&state, &query) {
        Ok(trader) => trader,
        Err(response) => return response,
    };

    match trader.get_performance() {
        Ok(performance) => Json(performance).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to analyze performance: {}", e),
        ),
    }
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::OPTIONS])
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::OPTIONS])
    }
}

pub fn build_router(state: Arc<ApiState>, config: &ApiServerConfig) -> Router {
    let api = Router::new()
        .route("/competition", get(handle_competition))
        .route("/traders", get(handle_traders))
        .route("/status", get(handle_status))
        .route("/account", get(handle_account))
        .route("/positions", get(handle_positions))
        .route("/decisions", get(handle_decisions))
        .route("/decisions/latest", get(handle_latest_decisions))
        .route("/statistics", get(handle_statistics))
        .route("/equity-history", get(handle_equity_history))
        .route("/performance", get(handle_performance));

    Router::new()
        .route("/health", get(handle_health))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .layer(build_cors_layer(&config.allowed_origins))
        .with_state(state)
}

/// Start the API server and the rate-limit cleanup task
pub async fn start_server(
    manager: Arc<TraderManager>,
    port: u16,
    config: ApiServerConfig,
) -> anyhow::Result<()> {
    let rate_limiter = config
        .enable_rate_limit
        .then(|| Arc::new(RateLimiter::new(config.rate_limit_rps)));

    if let Some(limiter) = &rate_limiter {
        let limiter = Arc::clone(limiter);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RATE_LIMIT_CLEANUP_INTERVAL).await;
                if shutdown::is_shutdown_requested() {
                    break;
                }
                limiter.cleanup();
            }
        });
    }

    let state = Arc::new(ApiState {
        manager,
        rate_limiter,
    });
    let app = build_router(state, &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    logger::info(
        LogTag::Api,
        &format!("API server listening on http://{}", addr),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        loop {
            if shutdown::is_shutdown_requested() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await?;

    logger::info(LogTag::Api, "API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(3);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        // Fourth request inside the same window is rejected
        assert!(!limiter.check(ip));

        // A different IP has its own counter
        let other: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.check(other));
    }

    #[test]
    fn test_rate_limiter_cleanup_keeps_recent() {
        let limiter = RateLimiter::new(10);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        limiter.check(ip);

        limiter.cleanup();
        assert_eq!(limiter.tracked_ips(), 1);
    }
}
