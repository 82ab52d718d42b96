//! Event coalescing for bursty devices.
//!
//! Cameras in burst mode and phones during bulk copies emit streams of
//! near-identical events. The coalescer forwards the first event in any
//! window and drops the rest, so downstream listeners re-scan once per
//! window instead of once per file.

use std::time::{Duration, Instant};

/// Default coalescing window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(50);

/// Single-owner coalescer; lives on the event pump task.
pub struct EventCoalescer {
    window: Duration,
    last_forwarded: Option<Instant>,
}

impl Default for EventCoalescer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl EventCoalescer {
    pub fn new(window: Duration) -> Self {
        Self { window, last_forwarded: None }
    }

    /// True iff the time since the last forwarded event has reached the
    /// window (always true for the first event). A `true` marks the event
    /// as forwarded.
    pub fn should_forward(&mut self) -> bool {
        let now = Instant::now();
        match self.last_forwarded {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last_forwarded = Some(now);
                true
            }
        }
    }

    /// Forgets history, e.g. on reconnect.
    pub fn reset(&mut self) {
        self.last_forwarded = None;
    }
}
