use std::sync::{Arc, Mutex};
use std::time::Duration;

use cellrunner::engine::{CoordinatorState, LifecycleObserver};
use cellrunner::sink::{KernelError, KernelNotice, LocationRef, OutputSink, SinkUpdate};

/// An [`OutputSink`] that records every call as a [`SinkUpdate`].
///
/// Clones share the same log, so a test keeps one clone and hands the other
/// to the runtime.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    updates: Arc<Mutex<Vec<SinkUpdate>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<SinkUpdate> {
        self.updates.lock().unwrap().clone()
    }

    /// Completed lines appended for `seq`, across every batch.
    pub fn lines(&self, seq: u64) -> Vec<String> {
        self.updates()
            .into_iter()
            .filter_map(|u| match u {
                SinkUpdate::Lines { seq: s, lines, .. } if s == seq => Some(lines),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn successes(&self) -> Vec<LocationRef> {
        self.collect(|u| match u {
            SinkUpdate::MarkSuccess(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn errors(&self) -> Vec<LocationRef> {
        self.collect(|u| match u {
            SinkUpdate::MarkError(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn running(&self) -> Vec<LocationRef> {
        self.collect(|u| match u {
            SinkUpdate::MarkRunning(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn cleared(&self) -> Vec<LocationRef> {
        self.collect(|u| match u {
            SinkUpdate::ClearLocation(loc) => Some(*loc),
            _ => None,
        })
    }

    pub fn tracebacks(&self) -> Vec<(Option<u64>, KernelError)> {
        self.collect(|u| match u {
            SinkUpdate::Traceback { seq, error } => Some((*seq, error.clone())),
            _ => None,
        })
    }

    pub fn clear_all_count(&self) -> usize {
        self.updates()
            .iter()
            .filter(|u| matches!(u, SinkUpdate::ClearAll))
            .count()
    }

    /// Wait until the recorded updates satisfy `pred`.
    pub async fn wait_until(&self, pred: impl Fn(&[SinkUpdate]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if pred(&self.updates.lock().unwrap()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for sink updates; recorded so far: {:#?}",
                self.updates()
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn collect<T>(&self, f: impl Fn(&SinkUpdate) -> Option<T>) -> Vec<T> {
        self.updates.lock().unwrap().iter().filter_map(f).collect()
    }

    fn record(&mut self, update: SinkUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

impl OutputSink for RecordingSink {
    fn open_section(&mut self, seq: u64) {
        self.record(SinkUpdate::OpenSection { seq });
    }

    fn append_line(&mut self, seq: u64, text: &str, is_error: bool) {
        self.record(SinkUpdate::Lines {
            seq,
            lines: vec![text.to_string()],
            is_error,
        });
    }

    fn append_lines(&mut self, seq: u64, lines: &[String], is_error: bool) {
        self.record(SinkUpdate::Lines {
            seq,
            lines: lines.to_vec(),
            is_error,
        });
    }

    fn append_progress(&mut self, seq: u64, text: &str, is_error: bool) {
        self.record(SinkUpdate::Progress {
            seq,
            text: text.to_string(),
            is_error,
        });
    }

    fn append_result(&mut self, seq: u64, text: &str) {
        self.record(SinkUpdate::Result {
            seq,
            text: text.to_string(),
        });
    }

    fn append_markdown(&mut self, seq: u64, text: &str) {
        self.record(SinkUpdate::Markdown {
            seq,
            text: text.to_string(),
        });
    }

    fn append_image(&mut self, seq: u64, path: &str) {
        self.record(SinkUpdate::Image {
            seq,
            path: path.to_string(),
        });
    }

    fn append_traceback(&mut self, seq: Option<u64>, error: &KernelError) {
        self.record(SinkUpdate::Traceback {
            seq,
            error: error.clone(),
        });
    }

    fn mark_running(&mut self, location: LocationRef) {
        self.record(SinkUpdate::MarkRunning(location));
    }

    fn mark_success(&mut self, location: LocationRef) {
        self.record(SinkUpdate::MarkSuccess(location));
    }

    fn mark_error(&mut self, location: LocationRef) {
        self.record(SinkUpdate::MarkError(location));
    }

    fn clear_location(&mut self, location: LocationRef) {
        self.record(SinkUpdate::ClearLocation(location));
    }

    fn clear_all(&mut self) {
        self.record(SinkUpdate::ClearAll);
    }

    fn interrupt_requested(&mut self, seq: Option<u64>) {
        self.record(SinkUpdate::InterruptRequested { seq });
    }

    fn input_requested(&mut self, prompt: &str) {
        self.record(SinkUpdate::InputRequested {
            prompt: prompt.to_string(),
        });
    }

    fn notice(&mut self, notice: &KernelNotice) {
        self.record(SinkUpdate::Notice(notice.clone()));
    }
}

/// Lifecycle notification as seen by a [`RecordingObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Changed(CoordinatorState, CoordinatorState),
    Stopped,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<Lifecycle>>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Lifecycle> {
        self.events.lock().unwrap().clone()
    }

    /// States entered, in order.
    pub fn states(&self) -> Vec<CoordinatorState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Lifecycle::Changed(_, to) => Some(to),
                Lifecycle::Stopped => None,
            })
            .collect()
    }

    pub fn stops(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Lifecycle::Stopped))
            .count()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_state_change(&mut self, from: CoordinatorState, to: CoordinatorState) {
        self.events.lock().unwrap().push(Lifecycle::Changed(from, to));
    }

    fn on_stop(&mut self) {
        self.events.lock().unwrap().push(Lifecycle::Stopped);
    }
}
