#![allow(dead_code, unused_imports)]

pub use cellrunner_test_utils::{
    ConfigFileBuilder, FakeKernel, Harness, HarnessBuilder, Lifecycle, RecordingObserver,
    RecordingSink, init_tracing, with_timeout,
};

use cellrunner::engine::Anchor;

/// Anchor for a cell whose marker sits on `line` in buffer 0.
pub fn cell_at(line: usize) -> Anchor {
    Anchor::new(0, line, line + 1)
}
