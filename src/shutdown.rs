//! Cooperative Shutdown Signal
//!
//! Every long-running loop in the service holds a clone of this signal and
//! checks it at its natural boundaries: between metrics in the ingestion
//! loop, between entries in an autosave pass, and in one-second increments
//! during interval waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Shared shutdown flag, passed by reference to all components at startup.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a clean shutdown. Idempotent.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait up to `secs` seconds, decomposed into one-second increments so a
    /// shutdown request is honored within a second. Returns `true` if
    /// shutdown was requested during (or before) the wait.
    pub fn wait_secs(&self, secs: u64) -> bool {
        for _ in 0..secs {
            if self.is_requested() {
                return true;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        self.is_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_request_is_visible_across_clones() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();
        assert!(!other.is_requested());
        signal.request();
        assert!(other.is_requested());
    }

    #[test]
    fn test_wait_returns_early_once_requested() {
        let signal = ShutdownSignal::new();
        signal.request();
        let start = Instant::now();
        assert!(signal.wait_secs(30));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_observes_request_within_a_second() {
        let signal = ShutdownSignal::new();
        let remote = signal.clone();
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            assert!(remote.wait_secs(60));
            start.elapsed()
        });
        std::thread::sleep(Duration::from_millis(200));
        signal.request();
        let elapsed = waiter.join().expect("waiter panicked");
        assert!(elapsed < Duration::from_secs(2));
    }
}
