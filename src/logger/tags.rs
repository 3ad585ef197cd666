/// Log tags identify the subsystem a message originates from.
///
/// Tags are rendered as a fixed-width bracket prefix and can be used for
/// filtering once per-module gating is needed.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    Trader,
    Watchdog,
    Risk,
    Storage,
    Exchange,
    Market,
    Ai,
    Api,
}

impl LogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogTag::System => "SYSTEM",
            LogTag::Trader => "TRADER",
            LogTag::Watchdog => "WATCHDOG",
            LogTag::Risk => "RISK",
            LogTag::Storage => "STORAGE",
            LogTag::Exchange => "EXCHANGE",
            LogTag::Market => "MARKET",
            LogTag::Ai => "AI",
            LogTag::Api => "API",
        }
    }
}

impl std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
