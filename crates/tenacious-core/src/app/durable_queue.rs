//! DurableQueue - binds one queue core to one owner partition of a store.
//!
//! # Flow
//! 1. `push` inserts the entry, then enqueues and wakes the core
//! 2. a worker runs the handler with the payload
//! 3. on success the entry is deleted; on failure it stays and the core retries
//! 4. `open` replays the owner's entries, so a restart resumes unfinished work
//!
//! The store always holds at least what the core holds. A crash between a
//! handler success and its delete causes one extra delivery after restart,
//! never a lost request.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use super::PayloadHandler;
use crate::domain::{PersistentEntry, Request};
use crate::error::QueueError;
use crate::ports::{EntryStore, StoreError};
use crate::queue::{QueueCore, RequestHandler};
use crate::worker::RunHandle;

pub struct DurableQueue {
    store: Arc<dyn EntryStore>,
    core: Arc<QueueCore>,
    owner: String,
}

impl DurableQueue {
    /// Bind `core` to `owner` and replay the owner's persisted entries.
    ///
    /// Fails with [`QueueError::Configuration`] on an empty owner and with
    /// [`QueueError::Persistence`] if the entries cannot be listed.
    #[instrument(skip(store, core, owner), fields(queue = %core.name()))]
    pub async fn open(
        store: Arc<dyn EntryStore>,
        core: Arc<QueueCore>,
        owner: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let owner = owner.into();
        if owner.trim().is_empty() {
            return Err(QueueError::Configuration("empty owner".to_string()));
        }

        let queue = Self { store, core, owner };
        queue.replay().await?;
        Ok(queue)
    }

    /// Load every persisted entry of the owner into the core, oldest first.
    async fn replay(&self) -> Result<usize, QueueError> {
        let entries = self.store.list_entries_by_owner(&self.owner).await?;
        let count = entries.len();

        for entry in entries {
            self.core.enqueue_request(Request::from(entry)).await;
        }

        // The dispatcher may already be parked on an empty list.
        if count > 0 {
            self.core.wake();
        }

        info!(owner = %self.owner, count, "replayed persisted entries");
        Ok(count)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn core(&self) -> &Arc<QueueCore> {
        &self.core
    }

    /// Persist a request, then queue it.
    ///
    /// Nothing reaches the core unless the insert succeeded. A live entry
    /// with the same ID fails with [`QueueError::DuplicateRequest`].
    #[instrument(skip(self, payload), fields(owner = %self.owner))]
    pub async fn push(&self, id: &str, payload: &str) -> Result<(), QueueError> {
        let internal_id = match self.store.insert_entry(&self.owner, id, payload).await {
            Ok(internal_id) => internal_id,
            Err(StoreError::Duplicate { external_id, .. }) => {
                return Err(QueueError::DuplicateRequest(external_id));
            }
            Err(err) => return Err(err.into()),
        };

        self.core
            .enqueue_request(Request::new(id, payload).with_entry_id(internal_id))
            .await;
        self.core.wake();

        info!(internal_id, "request pushed");
        Ok(())
    }

    /// Cancel a request and delete its entry.
    ///
    /// Removing an unknown or already finished ID succeeds; only a store
    /// failure is reported.
    #[instrument(skip(self), fields(owner = %self.owner))]
    pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
        self.core.remove(id).await;

        let deleted = self.store.delete_entry(&self.owner, id).await?;
        if deleted == 0 {
            warn!("no persisted entry to delete");
        }
        Ok(())
    }

    /// Start processing with `handler`.
    ///
    /// An entry is deleted only after the handler succeeded. If that delete
    /// fails the attempt counts as failed and the request is retried.
    pub fn run(&self, handler: Arc<dyn PayloadHandler>) -> Result<RunHandle, QueueError> {
        let persisting = PersistingHandler {
            store: Arc::clone(&self.store),
            owner: self.owner.clone(),
            inner: handler,
        };
        self.core.run(Arc::new(persisting))
    }

    /// Live persisted entries of this owner, oldest first.
    pub async fn list(&self) -> Result<Vec<PersistentEntry>, QueueError> {
        Ok(self.store.list_entries_by_owner(&self.owner).await?)
    }
}

/// Deletes the entry once the user handler succeeded.
struct PersistingHandler {
    store: Arc<dyn EntryStore>,
    owner: String,
    inner: Arc<dyn PayloadHandler>,
}

#[async_trait]
impl RequestHandler for PersistingHandler {
    async fn handle(&self, request: &Request) -> bool {
        if !self.inner.handle(&request.payload).await {
            return false;
        }

        // 同じ ID が remove 後に再 push されていても、自分の entry だけ消す
        let deleted = match request.entry_id {
            Some(entry_id) => self.store.delete_entry_by_id(&self.owner, entry_id).await,
            None => self.store.delete_entry(&self.owner, &request.id).await,
        };

        match deleted {
            Ok(_) => {
                info!(id = %request.id, "request finished, entry removed");
                true
            }
            Err(err) => {
                error!(id = %request.id, error = %err, "could not remove finished entry, will retry");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;
    use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

    use super::*;
    use crate::app::handler_fn;
    use crate::config::QueueConfig;
    use crate::impls::InMemoryEntryStore;

    /// In-memory store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryEntryStore,
        fail_inserts: AtomicBool,
        fail_deletes: AtomicBool,
    }

    #[async_trait]
    impl EntryStore for FlakyStore {
        async fn insert_entry(
            &self,
            owner: &str,
            external_id: &str,
            payload: &str,
        ) -> Result<i64, StoreError> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("insert refused".into()));
            }
            self.inner.insert_entry(owner, external_id, payload).await
        }

        async fn delete_entry(&self, owner: &str, external_id: &str) -> Result<u64, StoreError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("delete refused".into()));
            }
            self.inner.delete_entry(owner, external_id).await
        }

        async fn delete_entry_by_id(&self, owner: &str, internal_id: i64) -> Result<u64, StoreError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("delete refused".into()));
            }
            self.inner.delete_entry_by_id(owner, internal_id).await
        }

        async fn list_entries_by_owner(
            &self,
            owner: &str,
        ) -> Result<Vec<PersistentEntry>, StoreError> {
            self.inner.list_entries_by_owner(owner).await
        }
    }

    fn core() -> Arc<QueueCore> {
        Arc::new(
            QueueCore::new(QueueConfig::new("test").with_retry_period(Duration::from_secs(1)))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn empty_owner_is_a_configuration_error() {
        let store = Arc::new(InMemoryEntryStore::new());
        let result = DurableQueue::open(store, core(), "  ").await;
        assert!(matches!(result, Err(QueueError::Configuration(_))));
    }

    #[tokio::test]
    async fn push_persists_before_enqueue() {
        let store = Arc::new(InMemoryEntryStore::new());
        let queue = DurableQueue::open(store.clone(), core(), "o").await.unwrap();

        queue.push("a", "p").await.unwrap();

        let entries = queue.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].external_id, "a");
        assert_eq!(queue.core().pending_len().await, 1);
    }

    #[tokio::test]
    async fn failed_insert_leaves_core_untouched() {
        let store = Arc::new(FlakyStore::default());
        store.fail_inserts.store(true, Ordering::SeqCst);
        let queue = DurableQueue::open(store, core(), "o").await.unwrap();

        let err = queue.push("a", "p").await.unwrap_err();
        assert!(matches!(err, QueueError::Persistence(StoreError::Backend(_))));
        assert_eq!(queue.core().pending_len().await, 0);
    }

    #[tokio::test]
    async fn duplicate_push_is_rejected() {
        let store = Arc::new(InMemoryEntryStore::new());
        let queue = DurableQueue::open(store, core(), "o").await.unwrap();

        queue.push("a", "p1").await.unwrap();
        let err = queue.push("a", "p2").await.unwrap_err();

        assert!(matches!(err, QueueError::DuplicateRequest(ref id) if id == "a"));
        assert_eq!(queue.core().pending_len().await, 1);
    }

    #[tokio::test]
    async fn remove_deletes_entry_and_pending_request() {
        let store = Arc::new(InMemoryEntryStore::new());
        let queue = DurableQueue::open(store, core(), "o").await.unwrap();
        queue.push("a", "p").await.unwrap();

        queue.remove("a").await.unwrap();

        assert!(queue.list().await.unwrap().is_empty());
        assert_eq!(queue.core().pending_len().await, 0);
    }

    #[tokio::test]
    async fn removing_unknown_id_succeeds() {
        let store = Arc::new(InMemoryEntryStore::new());
        let queue = DurableQueue::open(store, core(), "o").await.unwrap();
        queue.remove("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn remove_propagates_store_failure() {
        let store = Arc::new(FlakyStore::default());
        let queue = DurableQueue::open(store.clone(), core(), "o").await.unwrap();
        queue.push("a", "p").await.unwrap();

        store.fail_deletes.store(true, Ordering::SeqCst);
        let err = queue.remove("a").await.unwrap_err();
        assert!(matches!(err, QueueError::Persistence(_)));
    }

    #[tokio::test]
    async fn open_replays_owner_entries_only() {
        let store = Arc::new(InMemoryEntryStore::new());
        store.insert_entry("o", "x", "d1").await.unwrap();
        store.insert_entry("o", "y", "d2").await.unwrap();
        store.insert_entry("someone-else", "z", "d3").await.unwrap();

        let queue = DurableQueue::open(store, core(), "o").await.unwrap();
        assert_eq!(queue.core().pending_len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cleanup_counts_as_failure() {
        let store = Arc::new(FlakyStore::default());
        let queue = DurableQueue::open(store.clone(), core(), "o").await.unwrap();
        queue.push("a", "p").await.unwrap();
        store.fail_deletes.store(true, Ordering::SeqCst);

        let (tx, mut rx) = unbounded_channel();
        let handle = queue
            .run(Arc::new(handler_fn(move |payload: String| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                    true
                }
            })))
            .unwrap();

        // first success cannot be recorded, so the request comes back
        rx.recv().await.unwrap();
        while queue.core().counts().await.awaiting_retry == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(queue.list().await.unwrap().len(), 1);
        store.fail_deletes.store(false, Ordering::SeqCst);
        rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.list().await.unwrap().is_empty());
        assert_eq!(queue.core().counts().await.total(), 0);

        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_of_removed_request_keeps_reused_id_persisted() {
        let store = Arc::new(InMemoryEntryStore::new());
        let core = Arc::new(
            QueueCore::new(
                QueueConfig::new("test")
                    .with_concurrency(2)
                    .with_retry_period(Duration::from_secs(1)),
            )
            .unwrap(),
        );
        let queue = DurableQueue::open(store, core, "o").await.unwrap();

        let release = Arc::new(Notify::new());
        let (tx, mut rx) = unbounded_channel();
        let gate = Arc::clone(&release);
        let handle = queue
            .run(Arc::new(handler_fn(move |payload: String| {
                let tx = tx.clone();
                let gate = Arc::clone(&gate);
                async move {
                    let _ = tx.send(payload.clone());
                    if payload == "old" {
                        gate.notified().await;
                        return true;
                    }
                    false
                }
            })))
            .unwrap();

        queue.push("a", "old").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "old");

        // the first attempt is still running while the ID is reused
        queue.remove("a").await.unwrap();
        queue.push("a", "new").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "new");

        release.notify_one();
        while queue.core().counts().await.cancel_requested > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let entries = queue.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, "new");
        assert_eq!(queue.core().counts().await.total(), 1);

        handle.shutdown_and_join().await;
    }

    struct Forward(UnboundedSender<String>);

    #[async_trait]
    impl RequestHandler for Forward {
        async fn handle(&self, request: &Request) -> bool {
            let _ = self.0.send(request.payload.clone());
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replay_into_running_core_starts_delivery() {
        let core = core();
        let (tx, mut rx) = unbounded_channel();
        let handle = core.run(Arc::new(Forward(tx))).unwrap();

        // dispatcher parks on an empty list
        tokio::time::sleep(Duration::from_millis(10)).await;

        let store = Arc::new(InMemoryEntryStore::new());
        store.insert_entry("o", "x", "d1").await.unwrap();
        store.insert_entry("o", "y", "d2").await.unwrap();
        let _queue = DurableQueue::open(store, Arc::clone(&core), "o").await.unwrap();

        let first = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert_eq!(first.unwrap().unwrap(), "d1");
        assert_eq!(rx.recv().await.unwrap(), "d2");

        handle.shutdown_and_join().await;
    }
}
