use serde::{Deserialize, Serialize};

/// Snapshot of the requests a core still tracks, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub cancel_requested: usize,
    pub awaiting_retry: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.cancel_requested + self.awaiting_retry
    }
}
