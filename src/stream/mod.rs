// src/stream/mod.rs

//! Streamed-output aggregation.
//!
//! Turns a potentially very high rate of kernel `stream` chunks into a
//! bounded sequence of sink updates:
//! - [`text`] splits chunks into completed lines and progress fragments
//!   (carriage-return redraw semantics, ANSI-aware emptiness checks).
//! - [`rate`] measures events per window and decides bulk mode.
//! - [`aggregator`] owns per-sequence state and the bulk batch.
//!
//! Everything here is synchronous and takes `now` explicitly; the async
//! runtime owns the actual timers.

pub mod aggregator;
pub mod rate;
pub mod text;

use std::time::Duration;

use crate::config::StreamSection;
use crate::types::Channel;

pub use aggregator::StreamAggregator;
pub use rate::RateMeter;

/// One partial-output event from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub seq: u64,
    pub channel: Channel,
    pub text: String,
}

impl StreamEvent {
    pub fn new(seq: u64, channel: Channel, text: impl Into<String>) -> Self {
        Self {
            seq,
            channel,
            text: text.into(),
        }
    }
}

/// Tuning for the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Events per window at which bulk mode starts.
    pub bulk_threshold: u32,
    /// Bulk batch is flushed once it holds this many lines.
    pub batch_max_lines: usize,
    /// Bulk batch is flushed once its oldest item is this old.
    pub batch_max_latency: Duration,
    /// Rate measurement window; bulk mode is re-evaluated once per window.
    pub rate_window: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            bulk_threshold: 800,
            batch_max_lines: 200,
            batch_max_latency: Duration::from_millis(40),
            rate_window: Duration::from_secs(1),
        }
    }
}

impl From<&StreamSection> for StreamSettings {
    fn from(section: &StreamSection) -> Self {
        Self {
            bulk_threshold: section.bulk_threshold,
            batch_max_lines: section.batch_max_lines,
            batch_max_latency: Duration::from_millis(section.batch_max_latency_ms),
            rate_window: Duration::from_millis(section.rate_window_ms),
        }
    }
}
