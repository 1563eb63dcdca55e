// src/stream/text.rs

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// CSI, OSC and two-byte escape sequences.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("ANSI escape pattern is valid")
});

pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// What a reader would actually see: no escape codes, no surrounding space.
pub fn visible(text: &str) -> String {
    strip_ansi(text).trim().to_string()
}

/// The last redraw frame of a segment: everything after the final `\r`.
pub fn terminal_frame(segment: &str) -> &str {
    match segment.rfind('\r') {
        Some(idx) => &segment[idx + 1..],
        None => segment,
    }
}

/// A chunk split at newlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitText<'a> {
    /// Segments that were terminated by `\n`.
    pub completed: Vec<&'a str>,
    /// Unterminated tail, if any.
    pub trailing: Option<&'a str>,
}

/// Split already-normalised text (no `\r\n`) at `\n`.
pub fn split_lines(text: &str) -> SplitText<'_> {
    let mut segments: Vec<&str> = text.split('\n').collect();
    // `split` always yields at least one segment; the last is unterminated.
    let tail = segments.pop().unwrap_or("");
    SplitText {
        completed: segments,
        trailing: (!tail.is_empty()).then_some(tail),
    }
}

pub fn normalize_newlines(text: &str) -> Cow<'_, str> {
    if text.contains("\r\n") {
        Cow::Owned(text.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(text)
    }
}

/// Drop redraw frames from an unterminated fragment that can no longer be
/// visible, keeping a trailing `\r` that may still pair with a `\n`.
pub fn compact_fragment(fragment: &mut String) {
    let body = fragment.strip_suffix('\r').unwrap_or(fragment);
    if let Some(idx) = body.rfind('\r') {
        fragment.drain(..=idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_osc_sequences() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(visible("  \x1b[2K  "), "");
    }

    #[test]
    fn terminal_frame_takes_text_after_last_carriage_return() {
        assert_eq!(terminal_frame("abc\rdef"), "def");
        assert_eq!(terminal_frame("10%\r20%\r30%"), "30%");
        assert_eq!(terminal_frame("plain"), "plain");
    }

    #[test]
    fn split_lines_reports_trailing_fragment() {
        let split = split_lines("a\nb\nprogress");
        assert_eq!(split.completed, vec!["a", "b"]);
        assert_eq!(split.trailing, Some("progress"));

        let split = split_lines("a\n");
        assert_eq!(split.completed, vec!["a"]);
        assert_eq!(split.trailing, None);
    }

    #[test]
    fn compaction_keeps_last_frame_and_pending_cr() {
        let mut f = "1%\r2%\r3%".to_string();
        compact_fragment(&mut f);
        assert_eq!(f, "3%");

        let mut f = "old\rnew\r".to_string();
        compact_fragment(&mut f);
        assert_eq!(f, "new\r");
    }
}
