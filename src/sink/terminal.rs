// src/sink/terminal.rs

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{KernelError, KernelNotice, LocationRef, OutputSink};

/// Plain terminal rendering used by the CLI.
///
/// Output of concurrent sequences cannot interleave (one request is in
/// flight at a time), so a single progress slot is enough.
pub struct TerminalSink {
    out: Box<dyn Write + Send>,
    /// Sequence whose progress line is currently drawn.
    progress: Option<u64>,
    failures: Arc<AtomicUsize>,
    /// Where kernel input prompts are forwarded for an answer.
    prompts: Option<mpsc::UnboundedSender<String>>,
}

impl TerminalSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            progress: None,
            failures: Arc::new(AtomicUsize::new(0)),
            prompts: None,
        }
    }

    pub fn with_prompts(mut self, prompts: mpsc::UnboundedSender<String>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// Shared counter of errored executions, readable after the sink has
    /// been handed to the runtime.
    pub fn failures(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.failures)
    }

    fn write(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            warn!(error = %e, "failed writing to terminal");
        }
    }

    /// Replace a drawn progress line with whatever comes next.
    fn end_progress(&mut self) {
        if self.progress.take().is_some() {
            self.write("\r\x1b[2K");
        }
    }

    fn line(&mut self, text: &str) {
        self.end_progress();
        self.write(&format!("{text}\n"));
    }
}

impl OutputSink for TerminalSink {
    fn open_section(&mut self, seq: u64) {
        self.line(&format!("--- [{seq}] ---"));
    }

    fn append_line(&mut self, _seq: u64, text: &str, _is_error: bool) {
        self.line(text);
    }

    fn append_progress(&mut self, seq: u64, text: &str, _is_error: bool) {
        self.write(&format!("\r\x1b[2K{text}"));
        self.progress = Some(seq);
    }

    fn append_result(&mut self, _seq: u64, text: &str) {
        self.line(&format!("=> {text}"));
    }

    fn append_image(&mut self, _seq: u64, path: &str) {
        self.line(&format!("[image] {path}"));
    }

    fn append_traceback(&mut self, seq: Option<u64>, error: &KernelError) {
        if seq.is_none() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.line(&format!("{}: {}", error.ename, error.evalue));
        for tb_line in error.traceback.lines() {
            self.line(tb_line);
        }
    }

    fn mark_running(&mut self, location: LocationRef) {
        self.line(&format!("[line {}] running", location.line + 1));
    }

    fn mark_success(&mut self, location: LocationRef) {
        self.line(&format!("[line {}] ok", location.line + 1));
    }

    fn mark_error(&mut self, location: LocationRef) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.line(&format!("[line {}] error", location.line + 1));
    }

    fn clear_location(&mut self, _location: LocationRef) {
        self.end_progress();
    }

    fn clear_all(&mut self) {
        self.end_progress();
    }

    fn interrupt_requested(&mut self, _seq: Option<u64>) {
        self.line("^C interrupt requested");
    }

    fn input_requested(&mut self, prompt: &str) {
        self.end_progress();
        self.write(prompt);
        let forwarded = self
            .prompts
            .as_ref()
            .is_some_and(|tx| tx.send(prompt.to_string()).is_ok());
        if !forwarded {
            debug!("no reader for kernel input; request left unanswered");
        }
    }

    fn notice(&mut self, notice: &KernelNotice) {
        let (what, message) = match notice {
            KernelNotice::Paused(m) => ("paused", m),
            KernelNotice::Resumed(m) => ("resumed", m),
            KernelNotice::PauseFailed(m) => ("pause failed", m),
            KernelNotice::ResumeFailed(m) => ("resume failed", m),
        };
        match message {
            Some(m) => self.line(&format!("kernel {what}: {m}")),
            None => self.line(&format!("kernel {what}")),
        }
    }
}
