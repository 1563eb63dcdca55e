// src/cells/cache.rs

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::debug;

use crate::sink::BufferId;

use super::block::{CodeBlock, find_code_block};
use super::markers::{MarkerState, compute_marker_state};

/// Per-buffer marker state, recomputed whenever the buffer's revision
/// counter moves.
#[derive(Debug, Default)]
pub struct MarkerCache {
    states: HashMap<BufferId, MarkerState>,
    recomputed: u64,
}

impl MarkerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `buffer` at `revision`, computing it on a miss.
    pub fn get_or_compute<S: AsRef<str>>(
        &mut self,
        buffer: BufferId,
        revision: u64,
        lines: &[S],
    ) -> &MarkerState {
        match self.states.entry(buffer) {
            Entry::Occupied(entry) if entry.get().revision == revision => entry.into_mut(),
            Entry::Occupied(mut entry) => {
                debug!(buffer, revision, "marker cache stale; recomputing");
                self.recomputed += 1;
                entry.insert(compute_marker_state(lines, revision));
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                debug!(buffer, revision, "marker cache miss");
                self.recomputed += 1;
                entry.insert(compute_marker_state(lines, revision))
            }
        }
    }

    /// [`find_code_block`] against the cached state.
    pub fn find_code_block<S: AsRef<str>>(
        &mut self,
        buffer: BufferId,
        revision: u64,
        lines: &[S],
        cursor_row: usize,
        include_subcells: bool,
    ) -> Option<CodeBlock> {
        let line_count = lines.len();
        let state = self.get_or_compute(buffer, revision, lines);
        find_code_block(state, line_count, cursor_row, include_subcells)
    }

    /// Forget a buffer that no longer exists.
    pub fn evict(&mut self, buffer: BufferId) {
        if self.states.remove(&buffer).is_some() {
            debug!(buffer, "evicted marker state");
        }
    }

    pub fn contains(&self, buffer: BufferId) -> bool {
        self.states.contains_key(&buffer)
    }

    /// How many times a state was (re)computed.
    pub fn recomputed(&self) -> u64 {
        self.recomputed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_revision_is_served_from_cache() {
        let mut cache = MarkerCache::new();
        let lines = ["#%%", "x"];

        cache.get_or_compute(1, 3, &lines);
        cache.get_or_compute(1, 3, &lines);
        assert_eq!(cache.recomputed(), 1);
    }

    #[test]
    fn revision_change_invalidates() {
        let mut cache = MarkerCache::new();

        let state = cache.get_or_compute(1, 1, &["x"]);
        assert!(state.is_empty());

        let state = cache.get_or_compute(1, 2, &["#%%", "x"]);
        assert_eq!(state.order, vec![0]);
        assert_eq!(state.revision, 2);
        assert_eq!(cache.recomputed(), 2);
    }

    #[test]
    fn buffers_are_independent_and_evictable() {
        let mut cache = MarkerCache::new();
        cache.get_or_compute(1, 1, &["#%%"]);
        cache.get_or_compute(2, 1, &["x"]);

        cache.evict(1);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));

        cache.get_or_compute(1, 1, &["#%%"]);
        assert_eq!(cache.recomputed(), 3);
    }

    #[test]
    fn find_code_block_uses_cached_state() {
        let mut cache = MarkerCache::new();
        let lines = ["#%%", "x=1", "##%%", "y=2"];

        let block = cache.find_code_block(9, 1, &lines, 1, true).unwrap();
        assert_eq!((block.start, block.end), (1, 3));
        cache.find_code_block(9, 1, &lines, 3, false);
        assert_eq!(cache.recomputed(), 1);
    }
}
