// src/cells/markers.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static SUB_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s*%%(.*)$").expect("sub-marker pattern is valid"));

static PARENT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s*%%(.*)$").expect("parent marker pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    Parent,
    Sub,
}

/// One marker line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub row: usize,
    /// 1-based parent index; 0 for sub-markers above the first parent.
    pub parent_index: usize,
    /// 1-based index under the parent, for sub-markers.
    pub sub_index: Option<usize>,
    /// Text after `%%`, trimmed.
    pub label: String,
    /// Display suffix for sub-markers (`a`, `b`, .. `z`, `aa`, ..).
    pub letter: Option<String>,
}

impl Marker {
    pub fn is_parent(&self) -> bool {
        self.kind == MarkerKind::Parent
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parent_index)?;
        if let Some(letter) = &self.letter {
            write!(f, "{letter}")?;
        }
        if !self.label.is_empty() {
            write!(f, " {}", self.label)?;
        }
        Ok(())
    }
}

/// Markers of one buffer at one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerState {
    pub markers: BTreeMap<usize, Marker>,
    /// Marker rows in ascending order.
    pub order: Vec<usize>,
    pub parent_total: usize,
    pub revision: u64,
}

impl MarkerState {
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn get(&self, row: usize) -> Option<&Marker> {
        self.markers.get(&row)
    }

    /// Markers in row order.
    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        self.markers.values()
    }

    /// Marker on `row`, or the closest one above it.
    pub fn enclosing(&self, row: usize) -> Option<&Marker> {
        self.markers.range(..=row).next_back().map(|(_, m)| m)
    }

    /// First marker at or below `from` that passes `filter`.
    pub fn next_from(&self, from: usize, filter: impl Fn(&Marker) -> bool) -> Option<&Marker> {
        self.markers.range(from..).map(|(_, m)| m).find(|m| filter(m))
    }
}

/// Recognise a marker line. Returns the kind and the trimmed label.
pub fn parse_marker(line: &str) -> Option<(MarkerKind, &str)> {
    let line = line.trim();
    if let Some(caps) = SUB_MARKER.captures(line) {
        let label = caps.get(1).map_or("", |m| m.as_str().trim());
        return Some((MarkerKind::Sub, label));
    }
    PARENT_MARKER.captures(line).map(|caps| {
        let label = caps.get(1).map_or("", |m| m.as_str().trim());
        (MarkerKind::Parent, label)
    })
}

/// Bijective base-26 suffix: 1 -> `a`, 26 -> `z`, 27 -> `aa`.
pub fn sub_letter(index: usize) -> String {
    let mut n = index;
    let mut out = Vec::new();
    while n > 0 {
        n -= 1;
        out.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Single pass over the buffer.
pub fn compute_marker_state<S: AsRef<str>>(lines: &[S], revision: u64) -> MarkerState {
    let mut state = MarkerState {
        revision,
        ..MarkerState::default()
    };
    let mut parent_index = 0;
    let mut sub_index = 0;

    for (row, line) in lines.iter().enumerate() {
        let Some((kind, label)) = parse_marker(line.as_ref()) else {
            continue;
        };

        let marker = match kind {
            MarkerKind::Parent => {
                parent_index += 1;
                sub_index = 0;
                Marker {
                    kind,
                    row,
                    parent_index,
                    sub_index: None,
                    label: label.to_string(),
                    letter: None,
                }
            }
            MarkerKind::Sub => {
                sub_index += 1;
                Marker {
                    kind,
                    row,
                    parent_index,
                    sub_index: Some(sub_index),
                    label: label.to_string(),
                    letter: Some(sub_letter(sub_index)),
                }
            }
        };
        state.order.push(row);
        state.markers.insert(row, marker);
    }

    state.parent_total = parent_index;
    state
}
