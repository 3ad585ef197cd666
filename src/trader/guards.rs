//! Close-path guards
//!
//! Two structures keep the watchdog and the AI cycle from fighting over the
//! same position:
//!
//! - `ForcedCloseRegistry` remembers which (symbol, side) pairs were force
//!   closed (or failed to close). An entry blocks further close attempts
//!   until the retry cool-down elapses.
//! - `CloseLockTable` hands out one async mutex per position key so every
//!   close path for that position serializes. Locks are removed only after
//!   a successful close; a failed close keeps the lock alive so retries
//!   queue up behind it.

use super::constants::POSITION_STOP_LOSS_RETRY_TIMEOUT;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

pub fn position_key(symbol: &str, side: &str) -> String {
    format!("{}_{}", symbol, side)
}

/// Registry of force-closed (or failed-to-close) positions
#[derive(Default)]
pub struct ForcedCloseRegistry {
    entries: RwLock<HashMap<String, Instant>>,
}

impl ForcedCloseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a position as force-closed (or close-failed) now
    pub fn mark(&self, key: &str) {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), Instant::now());
    }

    #[cfg(test)]
    pub fn mark_at(&self, key: &str, at: Instant) {
        self.entries.write().unwrap().insert(key.to_string(), at);
    }

    /// Raw mark lookup, no cool-down handling
    pub fn get_mark(&self, key: &str) -> Option<Instant> {
        self.entries.read().unwrap().get(key).copied()
    }

    /// Is the position currently blocked? An expired mark is cleared eagerly
    /// so the caller may retry.
    pub fn is_blocked(&self, key: &str) -> bool {
        let mark = { self.entries.read().unwrap().get(key).copied() };
        match mark {
            None => false,
            Some(at) if at.elapsed() > POSITION_STOP_LOSS_RETRY_TIMEOUT => {
                self.entries.write().unwrap().remove(key);
                false
            }
            Some(_) => true,
        }
    }

    /// Check without clearing: any live mark blocks
    pub fn has_mark(&self, key: &str) -> bool {
        self.entries.read().unwrap().contains_key(key)
    }

    pub fn clear(&self, key: &str) {
        self.entries.write().unwrap().remove(key);
    }

    /// Cycle-start cleanup: drop entries whose position no longer exists and
    /// whose mark has outlived the cool-down.
    pub fn cleanup(&self, live_keys: &std::collections::HashSet<String>) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|key, mark| {
            live_keys.contains(key) || mark.elapsed() <= POSITION_STOP_LOSS_RETRY_TIMEOUT
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-position close locks
#[derive(Default)]
pub struct CloseLockTable {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CloseLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the lock for a position key. The outer mutex is only
    /// held for the lookup; the returned lock is awaited by the caller.
    pub fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Remove the lock after a successful close
    pub fn release(&self, key: &str) {
        self.locks.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.locks.lock().unwrap().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    #[test]
    fn test_registry_blocks_until_cooldown() {
        let registry = ForcedCloseRegistry::new();
        let key = position_key("BTCUSDT", "long");

        assert!(!registry.is_blocked(&key));
        registry.mark(&key);
        assert!(registry.is_blocked(&key));

        // 4:59 after the mark: still blocked
        registry.mark_at(&key, Instant::now() - Duration::from_secs(299));
        assert!(registry.is_blocked(&key));

        // 5:01 after the mark: cleared eagerly, retry allowed
        registry.mark_at(&key, Instant::now() - Duration::from_secs(301));
        assert!(!registry.is_blocked(&key));
        assert!(!registry.has_mark(&key));
    }

    #[test]
    fn test_cleanup_keeps_live_positions_and_fresh_marks() {
        let registry = ForcedCloseRegistry::new();
        registry.mark("BTCUSDT_long");
        registry.mark_at("ETHUSDT_short", Instant::now() - Duration::from_secs(301));
        registry.mark_at("SOLUSDT_long", Instant::now() - Duration::from_secs(301));

        let mut live = HashSet::new();
        live.insert("SOLUSDT_long".to_string());

        registry.cleanup(&live);

        // Fresh mark survives even though the position is gone
        assert!(registry.has_mark("BTCUSDT_long"));
        // Expired mark with no position is dropped
        assert!(!registry.has_mark("ETHUSDT_short"));
        // Expired mark with a live position survives cleanup
        assert!(registry.has_mark("SOLUSDT_long"));
    }

    #[tokio::test]
    async fn test_close_locks_serialize_per_key() {
        let table = CloseLockTable::new();
        let lock_a = table.lock_for("BTCUSDT_long");
        let lock_b = table.lock_for("BTCUSDT_long");

        let guard = lock_a.lock().await;
        // Same key hands out the same lock
        assert!(lock_b.try_lock().is_err());
        drop(guard);
        assert!(lock_b.try_lock().is_ok());

        // Different key is independent
        let other = table.lock_for("ETHUSDT_short");
        assert!(other.try_lock().is_ok());
    }

    #[test]
    fn test_release_removes_lock_entry() {
        let table = CloseLockTable::new();
        table.lock_for("BTCUSDT_long");
        assert!(table.contains("BTCUSDT_long"));
        table.release("BTCUSDT_long");
        assert!(!table.contains("BTCUSDT_long"));
    }
}
