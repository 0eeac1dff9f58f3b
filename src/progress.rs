// ==============================================================================
// progress.rs - Job Progress Tracking
// ==============================================================================
// Description: Abort flag, first-error capture, and monotonic percent reporting
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Shared per-job progress state consulted at every stage boundary.
///
/// Abort is cooperative: loops observe the flag at their heads and stop
/// within one polling interval. The error slot keeps the first recorded
/// message; later errors are logged and dropped. Percent only moves forward.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    aborted: AtomicBool,
    has_error: AtomicBool,
    percent: AtomicU8,
    error: Mutex<Option<String>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative abort. Idempotent.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            debug!("abort requested");
        }
    }

    /// True once abort has been requested (does not reflect errors)
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Record an error. First call wins; subsequent calls are logged only.
    pub fn set_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut slot = self.error.lock().expect("error slot poisoned");
        if slot.is_none() {
            warn!(error = %message, "first export error recorded");
            *slot = Some(message);
            self.has_error.store(true, Ordering::SeqCst);
        } else {
            debug!(error = %message, "subsequent export error dropped (first error wins)");
        }
    }

    /// The first recorded error, if any
    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("error slot poisoned").clone()
    }

    /// True once either abort was requested or an error was recorded.
    /// Both loops poll this before issuing new work.
    pub fn should_stop(&self) -> bool {
        self.aborted.load(Ordering::SeqCst) || self.has_error.load(Ordering::SeqCst)
    }

    /// Report percent complete for the current step. Monotonic: a report
    /// lower than the current value is ignored. Clamped to 100.
    pub fn set_current_step_progress(&self, percent: u8) {
        let clamped = percent.min(100);
        self.percent.fetch_max(clamped, Ordering::SeqCst);
    }

    pub fn current_step_progress(&self) -> u8 {
        self.percent.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_wins() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.error(), None);

        tracker.set_error("index build failed");
        tracker.set_error("flush failed");

        assert_eq!(tracker.error(), Some("index build failed".to_string()));
        assert!(tracker.should_stop());
        assert!(!tracker.is_aborted());
    }

    #[test]
    fn test_abort_is_idempotent_and_stops() {
        let tracker = ProgressTracker::new();
        assert!(!tracker.should_stop());

        tracker.abort();
        tracker.abort();

        assert!(tracker.is_aborted());
        assert!(tracker.should_stop());
        assert_eq!(tracker.error(), None);
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let tracker = ProgressTracker::new();
        tracker.set_current_step_progress(40);
        tracker.set_current_step_progress(25);
        assert_eq!(tracker.current_step_progress(), 40);

        tracker.set_current_step_progress(200);
        assert_eq!(tracker.current_step_progress(), 100);
    }
}
