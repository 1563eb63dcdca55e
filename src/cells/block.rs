// src/cells/block.rs

use super::markers::{Marker, MarkerState};

/// A runnable span of rows, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub start: usize,
    pub end: usize,
    /// Marker heading the span; `None` for the region above the first marker.
    pub meta: Option<Marker>,
}

impl CodeBlock {
    pub fn rows(&self) -> std::ops::RangeInclusive<usize> {
        self.start..=self.end
    }

    /// The span's lines out of the whole buffer.
    pub fn code<S: AsRef<str>>(&self, lines: &[S]) -> String {
        lines
            .get(self.start..=self.end.min(lines.len().saturating_sub(1)))
            .unwrap_or_default()
            .iter()
            .map(|l| l.as_ref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Resolve the span that should run for a cursor on `cursor_row`.
///
/// Returns `None` when the buffer has no markers or the resolved span is
/// empty. With `include_subcells`, a span headed by a parent marker (or the
/// implicit top region) runs through its sub-cells up to the next parent.
pub fn find_code_block(
    state: &MarkerState,
    line_count: usize,
    cursor_row: usize,
    include_subcells: bool,
) -> Option<CodeBlock> {
    if state.is_empty() || line_count == 0 {
        return None;
    }
    let cursor_row = cursor_row.min(line_count - 1);

    let enclosing = state.enclosing(cursor_row);
    let start = enclosing.map_or(0, |m| m.row + 1);
    let skip_subs = include_subcells && enclosing.is_none_or(Marker::is_parent);

    let next = state.next_from(start, |m| !skip_subs || m.is_parent());
    let end = match next {
        Some(marker) => marker.row.checked_sub(1)?,
        None => line_count - 1,
    };

    if start > end {
        return None;
    }
    Some(CodeBlock {
        start,
        end,
        meta: enclosing.cloned(),
    })
}

/// Every non-empty region in row order: the implicit top region, then one
/// per marker.
pub fn cells(state: &MarkerState, line_count: usize) -> Vec<CodeBlock> {
    if line_count == 0 {
        return Vec::new();
    }

    let mut blocks = Vec::new();
    let first_row = state.order.first().copied().unwrap_or(line_count);
    if first_row > 0 {
        blocks.push(CodeBlock {
            start: 0,
            end: first_row - 1,
            meta: None,
        });
    }

    for (i, &row) in state.order.iter().enumerate() {
        let start = row + 1;
        let end = state
            .order
            .get(i + 1)
            .map_or(line_count - 1, |next| next - 1);
        if start > end {
            continue;
        }
        blocks.push(CodeBlock {
            start,
            end,
            meta: state.get(row).cloned(),
        });
    }
    blocks
}
