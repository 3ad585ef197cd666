//! Decision layer
//!
//! Everything between "here is the account + market state" and "here is a
//! validated list of trading decisions": context assembly types, prompt
//! construction, LLM response parsing, decision validation, per-position
//! logic records with their validity check, and the multi-timeframe
//! analyzer that orders candidates for the prompt.

pub mod analyzer;
pub mod engine;
pub mod logic;
pub mod strategy;
mod types;

pub use engine::{get_full_decision, parse_full_decision_response, validate_decisions};
pub use types::{AccountInfo, CandidateCoin, Context, Decision, FullDecision, PositionInfo};
