//! InMemoryEntryStore - development and test store.
//!
//! Behaves like the SQLite store (unique `(owner, external_id)`, ordered
//! listing) but forgets everything when dropped.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::PersistentEntry;
use crate::ports::{Clock, EntryStore, StoreError, SystemClock};

#[derive(Debug, Default)]
struct Entries {
    rows: Vec<PersistentEntry>,
    last_id: i64,
}

pub struct InMemoryEntryStore<C = SystemClock> {
    clock: C,
    entries: Mutex<Entries>,
}

impl InMemoryEntryStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for InMemoryEntryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryEntryStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Number of entries across all owners.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl<C: Clock> EntryStore for InMemoryEntryStore<C> {
    async fn insert_entry(
        &self,
        owner: &str,
        external_id: &str,
        payload: &str,
    ) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock().await;
        if entries
            .rows
            .iter()
            .any(|row| row.owner == owner && row.external_id == external_id)
        {
            return Err(StoreError::Duplicate {
                owner: owner.to_string(),
                external_id: external_id.to_string(),
            });
        }

        entries.last_id += 1;
        let internal_id = entries.last_id;
        entries.rows.push(PersistentEntry {
            internal_id,
            owner: owner.to_string(),
            external_id: external_id.to_string(),
            payload: payload.to_string(),
            creation_time: self.clock.now(),
        });
        Ok(internal_id)
    }

    async fn delete_entry(&self, owner: &str, external_id: &str) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().await;
        let before = entries.rows.len();
        entries
            .rows
            .retain(|row| !(row.owner == owner && row.external_id == external_id));
        Ok((before - entries.rows.len()) as u64)
    }

    async fn delete_entry_by_id(&self, owner: &str, internal_id: i64) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().await;
        let before = entries.rows.len();
        entries
            .rows
            .retain(|row| !(row.owner == owner && row.internal_id == internal_id));
        Ok((before - entries.rows.len()) as u64)
    }

    async fn list_entries_by_owner(&self, owner: &str) -> Result<Vec<PersistentEntry>, StoreError> {
        let entries = self.entries.lock().await;
        let mut rows: Vec<PersistentEntry> = entries
            .rows
            .iter()
            .filter(|row| row.owner == owner)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then(a.internal_id.cmp(&b.internal_id))
        });
        Ok(rows)
    }
}
