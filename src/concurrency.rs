// ==============================================================================
// concurrency.rs - Adaptive Fetch Concurrency Controller
// ==============================================================================
// Description: Feedback-controlled worker limit with a double backpressure
//              gate (running workers AND unconsumed reorder backlog)
// Author: Matt Barham
// Created: 2026-02-03
// Modified: 2026-02-03
// Version: 1.0.0
// ==============================================================================
// Algorithm:
//   - A worker may launch only while runningWorkers < limit AND the reorder
//     backlog < limit (throttles on connection pressure and memory pressure).
//   - Once per "generation" (completion of sequence S where
//     S % limit == limit - 1) the limit is re-evaluated:
//       running > 0.3 * limit  -> limit /= 1.5   (over-subscribed, shrink)
//       running < 0.5 * limit  -> limit *= 2     (under-subscribed, grow)
//     and clamped to [min, max].
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

use crate::error::ExportError;

/// Lower bound on the adaptive worker limit
pub const MIN_WORKERS: usize = 2;
/// Upper bound on the adaptive worker limit
pub const MAX_WORKERS: usize = 50;
/// Starting worker limit before any feedback has been observed
pub const INITIAL_WORKERS: usize = 5;

#[derive(Debug)]
struct ControllerState {
    limit: usize,
    running: usize,
}

/// Bounds for the adaptive limit, validated at construction
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerBounds {
    pub min: usize,
    pub max: usize,
    pub initial: usize,
}

impl Default for WorkerBounds {
    fn default() -> Self {
        Self {
            min: MIN_WORKERS,
            max: MAX_WORKERS,
            initial: INITIAL_WORKERS,
        }
    }
}

impl WorkerBounds {
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.min == 0 || self.min > self.max || self.initial < self.min || self.initial > self.max
        {
            return Err(ExportError::InvalidWorkerBounds {
                min: self.min,
                initial: self.initial,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Adjusts the number of concurrent fetch workers within fixed bounds.
///
/// All state lives behind one mutex so concurrent completion callbacks
/// cannot race on the limit: every read-modify-write is atomic with
/// respect to other completions and gate checks.
#[derive(Debug)]
pub struct ConcurrencyController {
    state: Mutex<ControllerState>,
    bounds: WorkerBounds,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        Self::with_bounds(WorkerBounds::default())
    }

    pub fn with_bounds(bounds: WorkerBounds) -> Self {
        Self {
            state: Mutex::new(ControllerState {
                limit: bounds.initial,
                running: 0,
            }),
            bounds,
        }
    }

    /// The backpressure gate: true iff a new fetch worker may start given
    /// the current running count AND the unconsumed reorder backlog.
    pub fn may_launch(&self, pending_chunks: usize) -> bool {
        let state = self.state.lock().expect("controller state poisoned");
        state.running < state.limit && pending_chunks < state.limit
    }

    /// Record a worker launch (caller checked `may_launch` first)
    pub fn on_worker_launched(&self) {
        let mut state = self.state.lock().expect("controller state poisoned");
        state.running += 1;
    }

    /// Record completion of the worker for `sequence`; once per generation
    /// of the current limit, re-evaluate the limit from the running count.
    pub fn on_worker_completed(&self, sequence: u64) {
        let mut state = self.state.lock().expect("controller state poisoned");
        state.running = state.running.saturating_sub(1);

        let limit = state.limit as u64;
        if sequence % limit == limit - 1 {
            let running = state.running as f64;
            let current = state.limit as f64;
            let adjusted = if running > 0.3 * current {
                // Workers pile up faster than they finish: shrink
                (current / 1.5) as usize
            } else if running < 0.5 * current {
                // Workers finish faster than they arrive: grow
                state.limit * 2
            } else {
                state.limit
            };
            let clamped = adjusted.clamp(self.bounds.min, self.bounds.max);
            if clamped != state.limit {
                debug!(
                    from = state.limit,
                    to = clamped,
                    running = state.running,
                    "adaptive worker limit adjusted"
                );
                state.limit = clamped;
            }
        }
    }

    pub fn current_limit(&self) -> usize {
        self.state.lock().expect("controller state poisoned").limit
    }

    pub fn running_workers(&self) -> usize {
        self.state.lock().expect("controller state poisoned").running
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new()
    }
}
