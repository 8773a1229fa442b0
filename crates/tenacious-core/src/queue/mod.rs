//! Queue module: request state, retry schedule and the in-memory core.

mod memory;
mod record;
mod retry;
mod schedule;
mod state;

pub use memory::QueueCore;
pub use record::RequestRecord;
pub use retry::RetryPolicy;
pub use state::RequestState;

use async_trait::async_trait;

use crate::domain::Request;

/// Processing function driven by the core.
///
/// `true` means the request is done. `false` means try again after the
/// retry period, unless the request was removed in the meantime.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &Request) -> bool;
}
