//! Payload handlers for the durable queue.

use std::future::Future;

use async_trait::async_trait;

/// Processing function seen by applications: payload in, done-or-retry out.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn handle(&self, payload: &str) -> bool;
}

/// Adapter returned by [`handler_fn`].
#[derive(Debug, Clone)]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`PayloadHandler`].
///
/// ```ignore
/// let handler = handler_fn(|payload: String| async move { send(&payload).await.is_ok() });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> PayloadHandler for FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn handle(&self, payload: &str) -> bool {
        (self.f)(payload.to_string()).await
    }
}
