//! Process-wide shutdown coordination
//!
//! All long-running loops (cycle runner, watchdog, cache sweeper, API
//! server) poll this flag instead of holding their own channels. The flag
//! only ever transitions from false to true; in-flight work completes
//! before each loop observes it and exits.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Request a graceful shutdown of all background loops
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Check whether a shutdown has been requested
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag_roundtrip() {
        assert!(!is_shutdown_requested());
        request_shutdown();
        assert!(is_shutdown_requested());

        // Reset so other tests in this process see a clean flag
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        assert!(!is_shutdown_requested());
    }
}
