use thiserror::Error;

use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Rejected at construction time (empty owner, zero workers, ...).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("request id={0} is already queued")]
    DuplicateRequest(String),

    #[error("queue is already running")]
    AlreadyRunning,
}
