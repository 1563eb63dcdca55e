// src/stream/aggregator.rs

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, trace};

use crate::sink::SinkUpdate;
use crate::types::Channel;

use super::rate::RateMeter;
use super::text::{compact_fragment, normalize_newlines, split_lines, terminal_frame, visible};
use super::{StreamEvent, StreamSettings};

/// Per (sequence, channel) reassembly state.
#[derive(Debug, Default)]
struct ChannelState {
    /// Unterminated text carried over to the next chunk.
    partial: String,
    /// Visible content of the last progress frame handed to the sink.
    last_progress: Option<String>,
}

/// Reassembles streamed chunks into sink updates.
///
/// In immediate mode every push returns its updates right away. Once the
/// event rate crosses the bulk threshold, updates are collected into a batch
/// that is flushed by size ([`StreamSettings::batch_max_lines`]), by age
/// ([`StreamAggregator::poll`]) or when bulk mode ends
/// ([`StreamAggregator::tick`]).
///
/// Updates for one sequence always come out in push order; flushing never
/// reorders.
#[derive(Debug)]
pub struct StreamAggregator {
    settings: StreamSettings,
    meter: RateMeter,
    open: HashSet<u64>,
    channels: HashMap<(u64, Channel), ChannelState>,
    batch: Vec<SinkUpdate>,
    batch_lines: usize,
    batch_started: Option<Instant>,
}

impl StreamAggregator {
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            meter: RateMeter::new(settings.bulk_threshold),
            settings,
            open: HashSet::new(),
            channels: HashMap::new(),
            batch: Vec::new(),
            batch_lines: 0,
            batch_started: None,
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Register a destination for `seq`. Events for unregistered sequences
    /// are dropped.
    pub fn open(&mut self, seq: u64) {
        self.open.insert(seq);
    }

    pub fn is_open(&self, seq: u64) -> bool {
        self.open.contains(&seq)
    }

    pub fn is_bulk(&self) -> bool {
        self.meter.is_bulk()
    }

    /// Nothing open and nothing waiting to be flushed.
    pub fn is_idle(&self) -> bool {
        self.open.is_empty() && self.batch.is_empty()
    }

    /// Feed one chunk. Returns the updates that are ready now.
    pub fn push(&mut self, event: StreamEvent, now: Instant) -> Vec<SinkUpdate> {
        if event.text.is_empty() {
            return Vec::new();
        }
        if !self.open.contains(&event.seq) {
            trace!(seq = event.seq, "dropping stream chunk for closed sequence");
            return Vec::new();
        }

        let bulk = self.meter.record(now);
        let updates = self.reassemble(&event);

        if !bulk {
            let mut ready = self.take_batch();
            ready.extend(updates);
            return ready;
        }

        if updates.is_empty() {
            return Vec::new();
        }
        self.batch_started.get_or_insert(now);
        for update in updates {
            self.enqueue(update);
        }
        if self.batch_lines >= self.settings.batch_max_lines {
            trace!(lines = self.batch_lines, "flushing full stream batch");
            return self.take_batch();
        }
        Vec::new()
    }

    /// Flush the batch once its oldest item has waited long enough.
    pub fn poll(&mut self, now: Instant) -> Vec<SinkUpdate> {
        match self.batch_started {
            Some(started) if now.duration_since(started) >= self.settings.batch_max_latency => {
                self.take_batch()
            }
            _ => Vec::new(),
        }
    }

    /// Close the current rate window. Flushes the batch when bulk mode ends.
    pub fn tick(&mut self, now: Instant) -> Vec<SinkUpdate> {
        if self.meter.tick(now) {
            Vec::new()
        } else {
            self.take_batch()
        }
    }

    /// Forget the event rate so the next burst is measured from scratch.
    pub fn reset_rate(&mut self) {
        self.meter.reset();
    }

    /// When the pending batch must be flushed, if there is one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.batch_started
            .map(|started| started + self.settings.batch_max_latency)
    }

    /// Deliver the pending batch now.
    pub fn flush(&mut self) -> Vec<SinkUpdate> {
        self.take_batch()
    }

    /// Flush everything and forget `seq`.
    ///
    /// The whole batch is flushed, not only `seq`'s share, so that updates of
    /// other sequences cannot end up behind later ones.
    pub fn close(&mut self, seq: u64) -> Vec<SinkUpdate> {
        let flushed = self.take_batch();
        self.open.remove(&seq);
        self.channels.retain(|(s, _), _| *s != seq);
        debug!(seq, flushed = flushed.len(), "stream destination closed");
        flushed
    }

    /// Drop all state. Returns whatever was batched so the caller can still
    /// deliver it.
    pub fn reset(&mut self) -> Vec<SinkUpdate> {
        let flushed = self.take_batch();
        self.open.clear();
        self.channels.clear();
        self.meter.reset();
        flushed
    }

    fn take_batch(&mut self) -> Vec<SinkUpdate> {
        self.batch_lines = 0;
        self.batch_started = None;
        std::mem::take(&mut self.batch)
    }

    /// Add to the batch, coalescing with the previous entry when possible.
    fn enqueue(&mut self, update: SinkUpdate) {
        match (self.batch.last_mut(), update) {
            (
                Some(SinkUpdate::Lines {
                    seq: last_seq,
                    lines: last_lines,
                    is_error: last_err,
                }),
                SinkUpdate::Lines {
                    seq,
                    lines,
                    is_error,
                },
            ) if *last_seq == seq && *last_err == is_error => {
                self.batch_lines += lines.len();
                last_lines.extend(lines);
            }
            (
                Some(SinkUpdate::Progress {
                    seq: last_seq,
                    text: last_text,
                    is_error: last_err,
                }),
                SinkUpdate::Progress {
                    seq,
                    text,
                    is_error,
                },
            ) if *last_seq == seq && *last_err == is_error => {
                // A newer frame of the same progress line supersedes the old one.
                *last_text = text;
            }
            (_, update) => {
                self.batch_lines += match &update {
                    SinkUpdate::Lines { lines, .. } => lines.len(),
                    _ => 1,
                };
                self.batch.push(update);
            }
        }
    }

    /// Apply carriage-return and newline semantics to one chunk.
    fn reassemble(&mut self, event: &StreamEvent) -> Vec<SinkUpdate> {
        let is_error = event.channel.is_error();
        let state = self
            .channels
            .entry((event.seq, event.channel))
            .or_default();

        let mut combined = std::mem::take(&mut state.partial);
        combined.push_str(&event.text);
        let normalized = normalize_newlines(&combined);
        let split = split_lines(&normalized);

        let mut updates = Vec::new();
        let mut lines = Vec::new();

        for segment in split.completed {
            let frame = terminal_frame(segment);
            if visible(frame).is_empty() {
                continue;
            }
            lines.push(frame.to_string());
            state.last_progress = None;
        }
        if !lines.is_empty() {
            updates.push(SinkUpdate::Lines {
                seq: event.seq,
                lines,
                is_error,
            });
        }

        if let Some(fragment) = split.trailing {
            let mut carried = fragment.to_string();
            compact_fragment(&mut carried);

            let body = fragment.strip_suffix('\r').unwrap_or(fragment);
            let frame = terminal_frame(body);
            let shown = visible(frame);
            if !shown.is_empty() && state.last_progress.as_deref() != Some(shown.as_str()) {
                state.last_progress = Some(shown);
                updates.push(SinkUpdate::Progress {
                    seq: event.seq,
                    text: frame.to_string(),
                    is_error,
                });
            }
            state.partial = carried;
        }

        updates
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn settings(threshold: u32, max_lines: usize) -> StreamSettings {
        StreamSettings {
            bulk_threshold: threshold,
            batch_max_lines: max_lines,
            ..StreamSettings::default()
        }
    }

    fn lines(seq: u64, lines: &[&str]) -> SinkUpdate {
        SinkUpdate::Lines {
            seq,
            lines: lines.iter().map(|l| l.to_string()).collect(),
            is_error: false,
        }
    }

    fn progress(seq: u64, text: &str) -> SinkUpdate {
        SinkUpdate::Progress {
            seq,
            text: text.to_string(),
            is_error: false,
        }
    }

    #[test]
    fn carriage_return_split_across_chunks_keeps_last_frame() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(StreamSettings::default());
        agg.open(1);

        let first = agg.push(StreamEvent::new(1, Channel::Stdout, "abc\r"), now);
        assert_eq!(first, vec![progress(1, "abc")]);

        let second = agg.push(StreamEvent::new(1, Channel::Stdout, "def\n"), now);
        assert_eq!(second, vec![lines(1, &["def"])]);
    }

    #[test]
    fn crlf_split_between_chunks_is_a_plain_newline() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(StreamSettings::default());
        agg.open(1);

        agg.push(StreamEvent::new(1, Channel::Stdout, "line\r"), now);
        let out = agg.push(StreamEvent::new(1, Channel::Stdout, "\nnext\n"), now);
        assert_eq!(out, vec![lines(1, &["line", "next"])]);
    }

    #[test]
    fn blank_and_escape_only_lines_are_skipped() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(StreamSettings::default());
        agg.open(1);

        let out = agg.push(
            StreamEvent::new(1, Channel::Stdout, "\n   \n\x1b[2K\nvalue\n"),
            now,
        );
        assert_eq!(out, vec![lines(1, &["value"])]);
    }

    #[test]
    fn repeated_progress_frame_is_suppressed() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(StreamSettings::default());
        agg.open(1);

        assert_eq!(
            agg.push(StreamEvent::new(1, Channel::Stdout, "50%"), now),
            vec![progress(1, "50%")]
        );
        assert!(agg
            .push(StreamEvent::new(1, Channel::Stdout, "\r50%"), now)
            .is_empty());
        assert_eq!(
            agg.push(StreamEvent::new(1, Channel::Stdout, "\r60%"), now),
            vec![progress(1, "60%")]
        );
    }

    #[test]
    fn progress_differing_only_in_escapes_or_padding_is_suppressed() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(StreamSettings::default());
        agg.open(1);

        assert_eq!(
            agg.push(StreamEvent::new(1, Channel::Stdout, "50%"), now),
            vec![progress(1, "50%")]
        );
        assert!(agg
            .push(StreamEvent::new(1, Channel::Stdout, "\r\x1b[32m50%\x1b[0m"), now)
            .is_empty());
        assert!(agg
            .push(StreamEvent::new(1, Channel::Stdout, "\r50% "), now)
            .is_empty());
        assert_eq!(
            agg.push(StreamEvent::new(1, Channel::Stdout, "\r\x1b[32m51%\x1b[0m"), now),
            vec![progress(1, "\x1b[32m51%\x1b[0m")]
        );
    }

    #[test]
    fn carriage_return_reassembly_does_not_depend_on_chunking() {
        let now = Instant::now();
        let mut whole = StreamAggregator::new(StreamSettings::default());
        whole.open(1);
        let whole_out = whole.push(StreamEvent::new(1, Channel::Stdout, "abc\rdef\n"), now);

        let mut split = StreamAggregator::new(StreamSettings::default());
        split.open(1);
        let mut split_out = Vec::new();
        for chunk in ["ab", "c\rde", "f\n"] {
            split_out.extend(split.push(StreamEvent::new(1, Channel::Stdout, chunk), now));
        }

        assert_eq!(whole_out, vec![lines(1, &["def"])]);
        let split_lines: Vec<_> = split_out
            .into_iter()
            .filter(|u| matches!(u, SinkUpdate::Lines { .. }))
            .collect();
        assert_eq!(split_lines, whole_out);
    }

    #[test]
    fn stderr_updates_are_flagged_as_errors() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(StreamSettings::default());
        agg.open(4);

        let out = agg.push(StreamEvent::new(4, Channel::Stderr, "boom\n"), now);
        assert_eq!(
            out,
            vec![SinkUpdate::Lines {
                seq: 4,
                lines: vec!["boom".into()],
                is_error: true,
            }]
        );
    }

    #[test]
    fn events_for_unknown_sequences_are_dropped() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(StreamSettings::default());
        assert!(agg
            .push(StreamEvent::new(9, Channel::Stdout, "lost\n"), now)
            .is_empty());
        assert!(agg.is_idle());
    }

    #[test]
    fn bulk_mode_batches_until_line_limit() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(settings(2, 3));
        agg.open(1);

        // First event is below the threshold and is delivered directly.
        assert_eq!(
            agg.push(StreamEvent::new(1, Channel::Stdout, "a\n"), now),
            vec![lines(1, &["a"])]
        );
        // Threshold reached: batching starts.
        assert!(agg
            .push(StreamEvent::new(1, Channel::Stdout, "b\n"), now)
            .is_empty());
        assert!(agg
            .push(StreamEvent::new(1, Channel::Stdout, "c\n"), now)
            .is_empty());
        assert_eq!(
            agg.push(StreamEvent::new(1, Channel::Stdout, "d\n"), now),
            vec![lines(1, &["b", "c", "d"])]
        );
    }

    #[test]
    fn bulk_batch_flushes_on_latency() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(settings(1, 1000));
        agg.open(1);

        assert!(agg
            .push(StreamEvent::new(1, Channel::Stdout, "x\n"), now)
            .is_empty());
        let deadline = agg.next_deadline().expect("batch pending");
        assert_eq!(deadline, now + Duration::from_millis(40));

        assert!(agg.poll(now + Duration::from_millis(10)).is_empty());
        assert_eq!(
            agg.poll(now + Duration::from_millis(40)),
            vec![lines(1, &["x"])]
        );
        assert!(agg.next_deadline().is_none());
    }

    #[test]
    fn bulk_progress_frames_coalesce() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(settings(1, 1000));
        agg.open(1);

        agg.push(StreamEvent::new(1, Channel::Stdout, "1%"), now);
        agg.push(StreamEvent::new(1, Channel::Stdout, "\r2%"), now);
        agg.push(StreamEvent::new(1, Channel::Stdout, "\r3%"), now);

        assert_eq!(agg.close(1), vec![progress(1, "3%")]);
    }

    #[test]
    fn leaving_bulk_mode_flushes_the_batch() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(settings(1, 1000));
        agg.open(1);

        agg.push(StreamEvent::new(1, Channel::Stdout, "x\n"), now);
        // Window that crossed the threshold keeps bulk for one more window.
        assert!(agg.tick(now + Duration::from_secs(1)).is_empty());
        assert_eq!(
            agg.tick(now + Duration::from_secs(2)),
            vec![lines(1, &["x"])]
        );
        assert!(!agg.is_bulk());
    }

    #[test]
    fn next_cell_starts_in_immediate_mode_after_rate_reset() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(settings(2, 1000));
        agg.open(1);
        agg.push(StreamEvent::new(1, Channel::Stdout, "a\n"), now);
        agg.push(StreamEvent::new(1, Channel::Stdout, "b\n"), now);
        agg.close(1);
        // The busy window still counts against the next one.
        assert!(agg.tick(now + Duration::from_secs(1)).is_empty());
        assert!(agg.is_idle());
        assert!(agg.is_bulk());

        agg.reset_rate();
        assert!(!agg.is_bulk());

        agg.open(2);
        assert_eq!(
            agg.push(StreamEvent::new(2, Channel::Stdout, "y\n"), now),
            vec![lines(2, &["y"])]
        );
    }

    #[test]
    fn close_flushes_batch_before_forgetting_sequence() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(settings(1, 1000));
        agg.open(1);
        agg.open(2);

        agg.push(StreamEvent::new(1, Channel::Stdout, "one\n"), now);
        agg.push(StreamEvent::new(2, Channel::Stdout, "two\n"), now);

        let flushed = agg.close(1);
        assert_eq!(flushed, vec![lines(1, &["one"]), lines(2, &["two"])]);
        assert!(!agg.is_open(1));
        assert!(agg.is_open(2));
        assert!(agg
            .push(StreamEvent::new(1, Channel::Stdout, "late\n"), now)
            .is_empty());
    }

    #[test]
    fn reset_returns_pending_batch_and_clears_state() {
        let now = Instant::now();
        let mut agg = StreamAggregator::new(settings(1, 1000));
        agg.open(1);
        agg.push(StreamEvent::new(1, Channel::Stdout, "x\n"), now);

        assert_eq!(agg.reset(), vec![lines(1, &["x"])]);
        assert!(agg.is_idle());
        assert!(!agg.is_bulk());
    }
}
