//! Shared cancellation token for run-wide shutdown.
//!
//! A signal handler or a fail-fast scheduler flips the token; workers poll it
//! between blocking waits and kill their subprocesses when it is set. No work
//! happens inside the signal handler itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why the run was cancelled. Workers only need to know *that* cancellation
/// happened; the scheduler uses the reason to pick the final run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// SIGINT/SIGTERM received
    Signal,
    /// A spec failed with fail-fast enabled
    FailFast,
}

/// Thread-safe cancellation flag shared between the supervisor and workers.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    by_signal: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Flip the token. First caller wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        if reason == CancelReason::Signal {
            self.by_signal.store(true, Ordering::SeqCst);
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True when cancellation came from SIGINT/SIGTERM rather than fail-fast.
    pub fn is_signalled(&self) -> bool {
        self.by_signal.load(Ordering::SeqCst)
    }
}

/// Install a Ctrl-C / SIGTERM handler that flips the given token.
///
/// Safe to call once per process; a second call returns an error from the
/// underlying handler registration, which callers may ignore in tests.
pub fn install_signal_handler(token: Arc<CancelToken>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        token.cancel(CancelReason::Signal);
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_clear() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(!token.is_signalled());
    }

    #[test]
    fn test_fail_fast_cancel_is_not_signal() {
        let token = CancelToken::new();
        token.cancel(CancelReason::FailFast);
        assert!(token.is_cancelled());
        assert!(!token.is_signalled());
    }

    #[test]
    fn test_signal_cancel_sets_both() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Signal);
        assert!(token.is_cancelled());
        assert!(token.is_signalled());
    }
}
