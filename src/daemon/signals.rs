//! Signal handling: SIGTERM/SIGINT graceful shutdown and SIGUSR1 on-demand
//! pruning of expired escalation rows.
//!
//! The decision loop polls these flags between observations; nothing blocks
//! on signals directly.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Signal state shared between OS handlers, reader threads and the loop.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    prune_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS hooks. Registration failures are
    /// logged, never fatal.
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// A handler with no OS hooks, driven only programmatically.
    pub fn detached() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            prune_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check (and clear) whether a prune has been requested.
    pub fn should_prune(&self) -> bool {
        self.prune_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_prune(&self) {
        self.prune_flag.store(true, Ordering::Relaxed);
    }

    /// The raw shutdown flag, for threads that only need to observe it.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    fn register_signals(&self) {
        for (signal, name) in [(SIGTERM, "SIGTERM"), (SIGINT, "SIGINT")] {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&self.shutdown_flag)) {
                tracing::warn!(signal = name, error = %e, "failed to register signal hook");
            }
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGUSR1;
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.prune_flag)) {
                tracing::warn!(signal = "SIGUSR1", error = %e, "failed to register signal hook");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let handler = SignalHandler::detached();
        assert!(!handler.should_shutdown());
        assert!(!handler.should_prune());
    }

    #[test]
    fn shutdown_is_sticky() {
        let handler = SignalHandler::detached();
        handler.request_shutdown();
        assert!(handler.should_shutdown());
        assert!(handler.should_shutdown());
    }

    #[test]
    fn prune_clears_on_read() {
        let handler = SignalHandler::detached();
        handler.request_prune();
        assert!(handler.should_prune());
        assert!(!handler.should_prune());
    }

    #[test]
    fn clones_share_state() {
        let handler = SignalHandler::detached();
        let clone = handler.clone();
        clone.request_shutdown();
        assert!(handler.should_shutdown());
    }
}
