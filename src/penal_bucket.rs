//! Leaky penalty bucket
//!
//! A process-wide counter filled by 0.1 each time the local box overshoots its
//! bandwidth target and drained continuously at one unit per `penalgdown`
//! seconds. `sigma` caches the sum of every box's `bucket`; the state model
//! recomputes it whenever a bucket changes.

use serde::Serialize;

/// Increment applied on a bandwidth overshoot
pub const PENAL_STEP: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct PenalBucket {
    count: f64,
    sigma: f64,
    /// Last drain time (ms)
    time_ms: u64,
    penalgdown: f64,
}

impl PenalBucket {
    pub fn new(now_ms: u64, penalgdown: f64) -> Self {
        Self {
            count: 0.0,
            sigma: 0.0,
            time_ms: now_ms,
            penalgdown,
        }
    }

    /// Drain the bucket up to `now_ms` and return the remaining count.
    pub fn drain(&mut self, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.time_ms) as f64;
        self.count -= elapsed / self.penalgdown / 1000.0;
        if self.count < 0.0 {
            self.count = 0.0;
        }
        self.time_ms = now_ms.max(self.time_ms);
        self.count
    }

    /// Add one overshoot step (call after [`drain`](Self::drain)).
    pub fn bump(&mut self) {
        self.count += PENAL_STEP;
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub(crate) fn set_sigma(&mut self, sigma: f64) {
        self.sigma = sigma;
    }

    /// Carry the level over a configuration reload
    pub(crate) fn restore(&mut self, previous: &PenalBucket) {
        self.count = previous.count;
        self.sigma = previous.sigma;
        self.time_ms = previous.time_ms;
    }
}
