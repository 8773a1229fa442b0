//! Request record: request + state.

use super::RequestState;
use crate::domain::Request;

/// Single source of truth for a request's state.
///
/// The pending list and the retry schedule hold tickets only; every
/// transition goes through this record while the core lock is held.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request: Request,
    pub state: RequestState,

    /// Number of times the request was handed to a worker.
    pub attempts: u32,
}

impl RequestRecord {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            state: RequestState::Pending,
            attempts: 0,
        }
    }

    pub fn start_attempt(&mut self) {
        self.state = RequestState::InFlight;
        self.attempts += 1;
    }

    pub fn request_cancel(&mut self) {
        self.state = RequestState::CancelRequested;
    }

    pub fn schedule_retry(&mut self) {
        self.state = RequestState::AwaitingRetry;
    }

    /// AwaitingRetry -> Pending
    pub fn requeue(&mut self) {
        self.state = RequestState::Pending;
    }
}
