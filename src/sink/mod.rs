// src/sink/mod.rs

//! Presentation sink contract.
//!
//! The coordinator and the stream aggregator never render anything. They
//! produce [`SinkUpdate`] values which the runtime applies, in order, to an
//! [`OutputSink`] supplied by the embedding application.

pub mod terminal;

pub use terminal::TerminalSink;

/// Identifies the buffer (document) a request was submitted from.
pub type BufferId = u64;

/// Where a request lives in its source buffer, for status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationRef {
    pub buffer: BufferId,
    /// Line the status indicator is anchored to (0-based).
    pub line: usize,
}

/// Error reported by the kernel for an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelError {
    pub ename: String,
    pub evalue: String,
    /// May contain ANSI escape codes.
    pub traceback: String,
}

/// Outcome of a pause/resume request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelNotice {
    Paused(Option<String>),
    Resumed(Option<String>),
    PauseFailed(Option<String>),
    ResumeFailed(Option<String>),
}

/// Receiver of every presentation-side effect.
///
/// `append_line` finishes a line; if a progress line is showing for the same
/// sequence, the completed line takes its place. `append_progress` replaces
/// the current progress line instead of adding a new one.
pub trait OutputSink: Send {
    fn open_section(&mut self, seq: u64);

    fn append_line(&mut self, seq: u64, text: &str, is_error: bool);

    fn append_lines(&mut self, seq: u64, lines: &[String], is_error: bool) {
        for line in lines {
            self.append_line(seq, line, is_error);
        }
    }

    fn append_progress(&mut self, seq: u64, text: &str, is_error: bool);

    fn append_result(&mut self, seq: u64, text: &str);

    fn append_markdown(&mut self, seq: u64, text: &str) {
        self.append_result(seq, text);
    }

    fn append_image(&mut self, seq: u64, path: &str) {
        self.append_result(seq, path);
    }

    /// Traceback of a failed execution; `seq` is `None` for bridge failures.
    fn append_traceback(&mut self, seq: Option<u64>, error: &KernelError);

    fn mark_running(&mut self, location: LocationRef);
    fn mark_success(&mut self, location: LocationRef);
    fn mark_error(&mut self, location: LocationRef);
    fn clear_location(&mut self, location: LocationRef);

    /// Drop every in-progress indicator in every buffer.
    fn clear_all(&mut self);

    fn interrupt_requested(&mut self, _seq: Option<u64>) {}

    fn input_requested(&mut self, _prompt: &str) {}

    fn notice(&mut self, _notice: &KernelNotice) {}
}

/// A single sink call, as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkUpdate {
    OpenSection { seq: u64 },
    Lines { seq: u64, lines: Vec<String>, is_error: bool },
    Progress { seq: u64, text: String, is_error: bool },
    Result { seq: u64, text: String },
    Markdown { seq: u64, text: String },
    Image { seq: u64, path: String },
    Traceback { seq: Option<u64>, error: KernelError },
    MarkRunning(LocationRef),
    MarkSuccess(LocationRef),
    MarkError(LocationRef),
    ClearLocation(LocationRef),
    ClearAll,
    InterruptRequested { seq: Option<u64> },
    InputRequested { prompt: String },
    Notice(KernelNotice),
}

impl SinkUpdate {
    pub fn apply<S: OutputSink + ?Sized>(&self, sink: &mut S) {
        match self {
            SinkUpdate::OpenSection { seq } => sink.open_section(*seq),
            SinkUpdate::Lines {
                seq,
                lines,
                is_error,
            } => sink.append_lines(*seq, lines, *is_error),
            SinkUpdate::Progress {
                seq,
                text,
                is_error,
            } => sink.append_progress(*seq, text, *is_error),
            SinkUpdate::Result { seq, text } => sink.append_result(*seq, text),
            SinkUpdate::Markdown { seq, text } => sink.append_markdown(*seq, text),
            SinkUpdate::Image { seq, path } => sink.append_image(*seq, path),
            SinkUpdate::Traceback { seq, error } => sink.append_traceback(*seq, error),
            SinkUpdate::MarkRunning(loc) => sink.mark_running(*loc),
            SinkUpdate::MarkSuccess(loc) => sink.mark_success(*loc),
            SinkUpdate::MarkError(loc) => sink.mark_error(*loc),
            SinkUpdate::ClearLocation(loc) => sink.clear_location(*loc),
            SinkUpdate::ClearAll => sink.clear_all(),
            SinkUpdate::InterruptRequested { seq } => sink.interrupt_requested(*seq),
            SinkUpdate::InputRequested { prompt } => sink.input_requested(prompt),
            SinkUpdate::Notice(notice) => sink.notice(notice),
        }
    }

    /// Sequence this update belongs to, if any.
    pub fn seq(&self) -> Option<u64> {
        match self {
            SinkUpdate::OpenSection { seq }
            | SinkUpdate::Lines { seq, .. }
            | SinkUpdate::Progress { seq, .. }
            | SinkUpdate::Result { seq, .. }
            | SinkUpdate::Markdown { seq, .. }
            | SinkUpdate::Image { seq, .. } => Some(*seq),
            SinkUpdate::Traceback { seq, .. } | SinkUpdate::InterruptRequested { seq } => *seq,
            _ => None,
        }
    }
}
