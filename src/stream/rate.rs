// src/stream/rate.rs

use std::time::Instant;

use tracing::debug;

/// Counts events per window and decides whether bulk mode applies.
///
/// Bulk mode starts as soon as the current window crosses the threshold and
/// holds for the following window; it ends at the first window boundary
/// after a window that stayed below the threshold.
#[derive(Debug, Clone)]
pub struct RateMeter {
    threshold: u32,
    current: u32,
    previous: u32,
    window_started: Option<Instant>,
}

impl RateMeter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            current: 0,
            previous: 0,
            window_started: None,
        }
    }

    /// Count one event. Returns whether bulk mode is now active.
    pub fn record(&mut self, now: Instant) -> bool {
        self.window_started.get_or_insert(now);
        self.current = self.current.saturating_add(1);
        self.is_bulk()
    }

    /// Close the current window. Returns whether bulk mode is still active.
    pub fn tick(&mut self, now: Instant) -> bool {
        let was_bulk = self.is_bulk();
        self.previous = self.current;
        self.current = 0;
        self.window_started = Some(now);
        let bulk = self.is_bulk();
        if was_bulk != bulk {
            debug!(rate = self.previous, bulk, "stream rate mode changed");
        }
        bulk
    }

    pub fn is_bulk(&self) -> bool {
        self.current >= self.threshold || self.previous >= self.threshold
    }

    /// Events counted in the current window.
    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = 0;
        self.previous = 0;
        self.window_started = None;
    }
}
