//! Port traits — the boundary between the messenger core and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ MessengerService (domain)
//! ```
//!
//! Driven adapters (console renderer, tick clock) implement these
//! traits. The service consumes them via generics, so the domain
//! core never touches a terminal or a wall clock directly. The
//! network boundary has its own, richer port:
//! [`Driver`](crate::net::driver::Driver).

use super::events::AppEvent;

// ───────────────────────────────────────────────────────────────
// Event sink port (domain → UI / logging)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`AppEvent`]s through this port.
/// Adapters decide where they go — terminal, log, a test recorder.
pub trait EventSink {
    fn emit(&mut self, event: &AppEvent);
}

// ───────────────────────────────────────────────────────────────
// Tick clock port (monotonic time)
// ───────────────────────────────────────────────────────────────

/// Monotonic 60 Hz tick source. All timeouts and intervals in the
/// system are measured against this counter.
pub trait TickClock {
    fn now_ticks(&self) -> u64;
}
