//! Host tick clock.
//!
//! Provides the monotonic 60 Hz tick counter the rest of the system
//! measures time against, backed by `std::time::Instant`.

use std::time::{Duration, Instant};

use crate::app::ports::TickClock;
use crate::config::TICK_HZ;

/// Instant-backed tick source.
pub struct HostClock {
    start: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Sleep roughly one tick; used by the main loop for frame
    /// pacing and by the quit path as its cooperative yield.
    pub fn sleep_one_tick(&self) {
        std::thread::sleep(Duration::from_micros(1_000_000 / TICK_HZ));
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for HostClock {
    fn now_ticks(&self) -> u64 {
        let elapsed = self.start.elapsed();
        elapsed.as_micros() as u64 * TICK_HZ / 1_000_000
    }
}

// ── Tests ────────────────────────────────────────────────────
