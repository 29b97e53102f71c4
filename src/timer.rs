// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimum-deadline priority queue of scheduled wakeups.
//!
//! Removal is lazy: cancelling a task's timer just bumps its generation so the stale heap
//! entry is recognized and skipped on pop, rather than paying for a linear scan or keeping an
//! indexed heap. At most one live entry exists per task at a time.

use crate::id::TaskId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    seq: u64,
    task: TaskId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest deadline first; ties break
        // FIFO by insertion sequence.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Entry>,
    /// The generation currently live for a task, if it has an outstanding timer.
    live: HashMap<TaskId, u64>,
    next_seq: u64,
}

impl TimerHeap {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(cap),
            live: HashMap::with_capacity(cap),
            next_seq: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Schedules `task` to wake at `deadline`, replacing any timer it already owns.
    pub(crate) fn insert(&mut self, task: TaskId, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(task, seq);
        self.heap.push(Entry { deadline, seq, task });
    }

    /// Tombstones `task`'s current timer, if any. The heap entry is skipped lazily on pop.
    pub(crate) fn remove(&mut self, task: TaskId) {
        self.live.remove(&task);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        // Skipping tombstoned entries here would require mutation; `pop_due` is the only
        // place that needs an exact answer, so this is intentionally a cheap over-estimate
        // when the head entry is stale (the loop simply polls once more than strictly
        // necessary, which is safe).
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops every timer whose deadline has elapsed by `now`, skipping stale entries.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<TaskId> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked");
            if self.live.get(&entry.task) == Some(&entry.seq) {
                self.live.remove(&entry.task);
                due.push(entry.task);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId(n)
    }

    #[test]
    fn pop_due_orders_by_deadline_then_fifo() {
        let mut heap = TimerHeap::default();
        let base = Instant::now();
        heap.insert(id(1), base + std::time::Duration::from_millis(10));
        heap.insert(id(2), base);
        heap.insert(id(3), base);

        let due = heap.pop_due(base + std::time::Duration::from_millis(20));
        assert_eq!(due, vec![id(2), id(3), id(1)]);
    }

    #[test]
    fn removed_timer_is_skipped() {
        let mut heap = TimerHeap::default();
        let base = Instant::now();
        heap.insert(id(1), base);
        heap.remove(id(1));
        assert!(heap.pop_due(base).is_empty());
        assert!(heap.is_empty());
    }

    #[test]
    fn reinserting_same_task_replaces_old_timer() {
        let mut heap = TimerHeap::default();
        let base = Instant::now();
        heap.insert(id(1), base);
        heap.insert(id(1), base + std::time::Duration::from_millis(5));
        let due = heap.pop_due(base);
        assert!(due.is_empty(), "stale entry must not fire");
        let due = heap.pop_due(base + std::time::Duration::from_millis(5));
        assert_eq!(due, vec![id(1)]);
    }
}
