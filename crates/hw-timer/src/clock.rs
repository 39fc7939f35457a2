//! Free-Running Clock

use tokio::time::Instant;

/// Monotonic process-lifetime clock
///
/// Independent of every timer instance: starting, stopping or resetting a
/// timer never affects it. Backed by tokio's clock so paused-time tests see
/// deterministic timestamps.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// Start a clock at zero
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Milliseconds since start, wrapping at `u32::MAX`
    pub fn millis(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }

    /// Microseconds since start
    pub fn micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
