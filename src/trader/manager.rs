//! Multi-trader registry
//!
//! Owns every AutoTrader instance, spawns their run loops and serves the
//! read API with lookups and cross-trader comparison data.

use super::engine::AutoTrader;
use crate::logger::{self, LogTag};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub struct TraderManager {
    traders: RwLock<HashMap<String, Arc<AutoTrader>>>,
}

impl TraderManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trader(&self, trader: Arc<AutoTrader>) -> Result<()> {
        let mut traders = self.traders.write().unwrap();
        if traders.contains_key(trader.id()) {
            bail!("trader id '{}' already exists", trader.id());
        }
        logger::info(
            LogTag::System,
            &format!("trader '{}' ({}) registered", trader.name(), trader.ai_model()),
        );
        traders.insert(trader.id().to_string(), trader);
        Ok(())
    }

    pub fn get_trader(&self, id: &str) -> Option<Arc<AutoTrader>> {
        self.traders.read().unwrap().get(id).cloned()
    }

    pub fn trader_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.traders.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn all_traders(&self) -> Vec<Arc<AutoTrader>> {
        self.traders.read().unwrap().values().cloned().collect()
    }

    /// Spawn the run loop of every registered trader
    pub fn start_all(&self) {
        logger::info(LogTag::System, "starting all traders");
        for trader in self.all_traders() {
            let name = trader.name().to_string();
            tokio::spawn(async move {
                logger::info(LogTag::System, &format!("▶️  launching {}", name));
                trader.run().await;
            });
        }
    }

    pub fn stop_all(&self) {
        logger::info(LogTag::System, "stopping all traders");
        for trader in self.all_traders() {
            trader.stop();
        }
    }

    /// Cross-trader comparison payload for the read API
    pub async fn comparison_data(&self) -> serde_json::Value {
        let mut rows = Vec::new();
        for trader in self.all_traders() {
            let Ok(account) = trader.get_account_info().await else {
                continue;
            };
            rows.push(serde_json::json!({
                "trader_id": trader.id(),
                "trader_name": trader.name(),
                "ai_model": trader.ai_model(),
                "total_equity": account["total_equity"],
                "total_pnl": account["total_pnl"],
                "total_pnl_pct": account["total_pnl_pct"],
                "position_count": account["position_count"],
                "margin_used_pct": account["margin_used_pct"],
                "call_count": trader.call_count(),
                "is_running": trader.is_running(),
            }));
        }

        serde_json::json!({
            "traders": rows,
            "count": rows.len(),
        })
    }
}
