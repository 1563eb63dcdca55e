// src/engine/queue.rs

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::sink::{BufferId, LocationRef};

/// A submitted piece of code. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub sequence: u64,
    pub code: String,
    pub anchor_line: usize,
    pub start_line: usize,
}

/// Bookkeeping for a request that has not been finalised yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub sequence: u64,
    pub anchor_line: usize,
    pub start_line: usize,
    pub owner: BufferId,
    /// Set by a kernel `error`; suppresses the success indicator on `done`.
    pub errored: bool,
}

impl PendingEntry {
    pub fn location(&self) -> LocationRef {
        LocationRef {
            buffer: self.owner,
            line: self.anchor_line,
        }
    }
}

/// FIFO of execution requests with at most one in flight.
///
/// The head is in flight iff `inflight` is set. Pending entries are created
/// on submission and outlive the queue slot: a request leaves the queue when
/// its execution ends, its entry when it is finalised.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    requests: VecDeque<ExecutionRequest>,
    inflight: bool,
    pending: HashMap<u64, PendingEntry>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: ExecutionRequest, owner: BufferId) {
        self.pending.insert(
            request.sequence,
            PendingEntry {
                sequence: request.sequence,
                anchor_line: request.anchor_line,
                start_line: request.start_line,
                owner,
                errored: false,
            },
        );
        self.requests.push_back(request);
    }

    /// Requests in the queue, including the one in flight.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// No requests and no unfinalised entries.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.pending.is_empty()
    }

    pub fn is_inflight(&self) -> bool {
        self.inflight
    }

    pub fn inflight_seq(&self) -> Option<u64> {
        if self.inflight {
            self.requests.front().map(|r| r.sequence)
        } else {
            None
        }
    }

    /// Mark the head as in flight and return it, unless something already is.
    pub fn dispatch_next(&mut self) -> Option<ExecutionRequest> {
        if self.inflight {
            return None;
        }
        let head = self.requests.front()?.clone();
        self.inflight = true;
        Some(head)
    }

    /// Pop the in-flight head.
    pub fn complete_head(&mut self) -> Option<ExecutionRequest> {
        if !self.inflight {
            return None;
        }
        self.inflight = false;
        self.requests.pop_front()
    }

    pub fn pending(&self, sequence: u64) -> Option<&PendingEntry> {
        self.pending.get(&sequence)
    }

    /// Sequences with unfinalised entries, ascending.
    pub fn pending_sequences(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self.pending.keys().copied().collect();
        seqs.sort_unstable();
        seqs
    }

    pub fn mark_errored(&mut self, sequence: u64) -> Option<&PendingEntry> {
        let entry = self.pending.get_mut(&sequence)?;
        entry.errored = true;
        Some(entry)
    }

    /// Remove the entry for a finished execution.
    pub fn finalize(&mut self, sequence: u64) -> Option<PendingEntry> {
        self.pending.remove(&sequence)
    }

    /// Discard every request that is not in flight, with its entry.
    pub fn drop_queued(&mut self) -> Vec<PendingEntry> {
        let keep = usize::from(self.inflight);
        let dropped: Vec<ExecutionRequest> = self.requests.drain(keep..).collect();
        let entries: Vec<PendingEntry> = dropped
            .iter()
            .filter_map(|r| self.pending.remove(&r.sequence))
            .collect();
        if !entries.is_empty() {
            debug!(count = entries.len(), "discarded queued requests");
        }
        entries
    }

    /// Give up on the in-flight request without waiting for the kernel.
    pub fn release_inflight(&mut self) -> Option<PendingEntry> {
        let head = self.complete_head()?;
        self.pending.remove(&head.sequence)
    }

    /// Release entries whose request already left the queue but which were
    /// never finalised, such as an errored request still waiting for `done`.
    pub fn release_detached(&mut self) -> Vec<PendingEntry> {
        let queued: Vec<u64> = self.requests.iter().map(|r| r.sequence).collect();
        let mut released: Vec<PendingEntry> = Vec::new();
        self.pending.retain(|seq, entry| {
            if queued.contains(seq) {
                true
            } else {
                released.push(entry.clone());
                false
            }
        });
        released.sort_unstable_by_key(|e| e.sequence);
        released
    }

    /// Drop everything. Returns the released entries in sequence order.
    pub fn clear(&mut self) -> Vec<PendingEntry> {
        self.requests.clear();
        self.inflight = false;
        let mut entries: Vec<PendingEntry> = self.pending.drain().map(|(_, e)| e).collect();
        entries.sort_unstable_by_key(|e| e.sequence);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(sequence: u64) -> ExecutionRequest {
        ExecutionRequest {
            sequence,
            code: format!("x = {sequence}"),
            anchor_line: sequence as usize,
            start_line: sequence as usize,
        }
    }

    #[test]
    fn only_one_request_is_dispatched_at_a_time() {
        let mut queue = ExecutionQueue::new();
        queue.push(request(1), 0);
        queue.push(request(2), 0);

        assert_eq!(queue.dispatch_next().map(|r| r.sequence), Some(1));
        assert_eq!(queue.dispatch_next(), None);
        assert_eq!(queue.inflight_seq(), Some(1));

        assert_eq!(queue.complete_head().map(|r| r.sequence), Some(1));
        assert_eq!(queue.dispatch_next().map(|r| r.sequence), Some(2));
    }

    #[test]
    fn drop_queued_keeps_inflight_request() {
        let mut queue = ExecutionQueue::new();
        for seq in 1..=3 {
            queue.push(request(seq), 0);
        }
        queue.dispatch_next();

        let dropped: Vec<u64> = queue.drop_queued().iter().map(|e| e.sequence).collect();
        assert_eq!(dropped, vec![2, 3]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_sequences(), vec![1]);
    }

    #[test]
    fn drop_queued_without_inflight_drops_all() {
        let mut queue = ExecutionQueue::new();
        queue.push(request(1), 0);
        queue.push(request(2), 0);

        assert_eq!(queue.drop_queued().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn entry_outlives_queue_slot_until_finalized() {
        let mut queue = ExecutionQueue::new();
        queue.push(request(1), 4);
        queue.dispatch_next();
        queue.mark_errored(1);
        queue.complete_head();

        assert_eq!(queue.len(), 0);
        assert!(!queue.is_empty());
        let entry = queue.finalize(1).unwrap();
        assert!(entry.errored);
        assert_eq!(entry.location(), LocationRef { buffer: 4, line: 1 });
        assert!(queue.is_empty());
    }

    #[test]
    fn release_inflight_frees_head_and_entry() {
        let mut queue = ExecutionQueue::new();
        queue.push(request(1), 0);
        queue.push(request(2), 0);
        queue.dispatch_next();

        assert_eq!(queue.release_inflight().map(|e| e.sequence), Some(1));
        assert!(!queue.is_inflight());
        assert_eq!(queue.pending_sequences(), vec![2]);
    }

    #[test]
    fn release_detached_only_frees_entries_outside_the_queue() {
        let mut queue = ExecutionQueue::new();
        queue.push(request(1), 0);
        queue.push(request(2), 0);
        queue.push(request(3), 0);
        queue.dispatch_next();
        queue.mark_errored(1);
        queue.complete_head();
        queue.dispatch_next();

        let released: Vec<u64> = queue.release_detached().iter().map(|e| e.sequence).collect();
        assert_eq!(released, vec![1]);
        assert_eq!(queue.pending_sequences(), vec![2, 3]);
        assert_eq!(queue.inflight_seq(), Some(2));
    }
}
