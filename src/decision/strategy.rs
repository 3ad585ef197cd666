//! Strategy prompt loading
//!
//! Strategies live under `strategies/<name>/prompt.txt` next to the binary.
//! A missing or unreadable file falls back to a built-in baseline so a bad
//! deployment never leaves the trader without a system prompt.

use crate::logger::{self, LogTag};
use std::path::PathBuf;

const DEFAULT_PROMPT: &str = "You are a professional cryptocurrency trading AI operating \
autonomously on a perpetual futures exchange. Analyze the provided account state, open \
positions and candidate markets, then respond with your chain-of-thought analysis followed \
by a JSON array of decisions. Respect risk limits, prefer high-conviction setups and always \
plan the exit when opening a position.";

fn strategy_path(name: &str) -> PathBuf {
    PathBuf::from("strategies").join(name).join("prompt.txt")
}

/// Load the prompt text for a named strategy
pub fn load_strategy_prompt(name: &str) -> Option<String> {
    let path = strategy_path(name);
    match std::fs::read_to_string(&path) {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => {
            logger::warning(
                LogTag::Ai,
                &format!("strategy prompt {} is empty", path.display()),
            );
            None
        }
        Err(e) => {
            logger::warning(
                LogTag::Ai,
                &format!("failed to load strategy prompt {}: {}", path.display(), e),
            );
            None
        }
    }
}

/// Strategy prompt or the built-in fallback
pub fn strategy_prompt_or_default(name: &str) -> String {
    let name = if name.is_empty() { "base_prompt" } else { name };
    load_strategy_prompt(name).unwrap_or_else(|| DEFAULT_PROMPT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_strategy_falls_back() {
        let prompt = strategy_prompt_or_default("definitely_not_a_strategy");
        assert!(prompt.contains("chain-of-thought"));
    }
}
