use super::Task;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// A delayed task waiting in the timer queue.
struct TimerEntry {
    deadline: Instant,
    /// Insertion order; keeps timers with equal deadlines FIFO.
    seq: u64,
    task: Task,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for TimerEntry {
    /// Reversed so that `BinaryHeap<TimerEntry>` pops the earliest deadline
    /// first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of delayed tasks.
#[derive(Default)]
pub(super) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(super) fn push(&mut self, deadline: Instant, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            task,
        });
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.deadline)
    }

    pub(super) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Removes every task whose deadline is at or before `now`, earliest
    /// first.
    pub(super) fn pop_expired(&mut self, now: Instant) -> Vec<Task> {
        let mut expired = Vec::new();
        while self.heap.peek().is_some_and(|entry| entry.deadline <= now) {
            if let Some(entry) = self.heap.pop() {
                expired.push(entry.task);
            }
        }
        expired
    }
}
