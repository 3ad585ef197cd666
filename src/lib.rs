//! perpbot — AI-driven perpetual futures trading agent
//!
//! A long-running control loop collects market data and account state,
//! consults an LLM for trading decisions, executes them against the
//! exchange and records every step durably. An independent 10-second
//! watchdog enforces per-position stop-loss limits regardless of what the
//! model is doing.

pub mod api;
pub mod config;
pub mod decision;
pub mod exchange;
pub mod llm;
pub mod logger;
pub mod market;
pub mod pool;
pub mod shutdown;
pub mod storage;
pub mod trader;
