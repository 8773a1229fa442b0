//! EntryStore port - durable mirror of queued requests.
//!
//! The queue never talks to a database directly; it only needs these three
//! operations, each transactional on its own.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::PersistentEntry;

#[derive(Debug, Error)]
pub enum StoreError {
    /// `(owner, external_id)` already has a live entry.
    #[error("entry already exists: owner={owner} external_id={external_id}")]
    Duplicate { owner: String, external_id: String },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("store task failed: {0}")]
    Join(String),
}

/// Storage for persistent entries, partitioned by owner.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Persist a new entry and return its internal ID.
    async fn insert_entry(
        &self,
        owner: &str,
        external_id: &str,
        payload: &str,
    ) -> Result<i64, StoreError>;

    /// Delete the entry for `(owner, external_id)`.
    ///
    /// Returns the number of deleted rows; deleting a missing entry is `Ok(0)`.
    async fn delete_entry(&self, owner: &str, external_id: &str) -> Result<u64, StoreError>;

    /// Delete one specific entry by its internal ID.
    ///
    /// Unlike [`delete_entry`](Self::delete_entry) this never touches a
    /// later entry that reused the same external ID.
    async fn delete_entry_by_id(&self, owner: &str, internal_id: i64) -> Result<u64, StoreError>;

    /// All entries of `owner`, oldest first.
    async fn list_entries_by_owner(&self, owner: &str) -> Result<Vec<PersistentEntry>, StoreError>;
}
