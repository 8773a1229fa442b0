//! Request state machine for the core.

use serde::{Deserialize, Serialize};

/// State of a request the core still tracks.
///
/// State transitions:
/// - Pending -> InFlight -> (success) removed
/// - Pending -> InFlight -> AwaitingRetry -> Pending (unbounded)
/// - InFlight -> CancelRequested -> (failure or success) removed
/// - Pending | AwaitingRetry -> (remove) removed
///
/// A finished request has no state: its record is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    /// Waiting in the pending list.
    Pending,

    /// Handed to a worker.
    InFlight,

    /// Removed while a worker holds it; must not come back.
    CancelRequested,

    /// Failed and waiting for the retry period to elapse.
    AwaitingRetry,
}

impl RequestState {
    /// Can a removal drop the record right away?
    pub fn is_detached(self) -> bool {
        matches!(self, RequestState::Pending | RequestState::AwaitingRetry)
    }

    pub fn is_runnable(self) -> bool {
        matches!(self, RequestState::Pending)
    }
}
