//! Retry schedule: one min-heap of deadlines shared by every request.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::domain::Ticket;

/// Scheduled retry entry.
///
/// Ordering is reversed so `BinaryHeap` pops the earliest deadline first.
/// Ties fall back to the ticket so older requests win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScheduledRetry {
    pub due: Instant,
    pub ticket: Ticket,
}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.ticket.cmp(&self.ticket))
    }
}

#[derive(Debug, Default)]
pub(crate) struct RetrySchedule {
    heap: BinaryHeap<ScheduledRetry>,
}

impl RetrySchedule {
    pub fn push(&mut self, due: Instant, ticket: Ticket) {
        self.heap.push(ScheduledRetry { due, ticket });
    }

    /// Earliest deadline, if any. Entries may be stale.
    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.due)
    }

    /// Pop the next entry whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Ticket> {
        if self.heap.peek()?.due > now {
            return None;
        }
        self.heap.pop().map(|entry| entry.ticket)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
