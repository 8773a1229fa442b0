//! SqliteEntryStore - durable store on a single SQLite database.
//!
//! One row per live request, keyed by an autoincrement surrogate ID.
//! rusqlite is blocking, so every call runs under `spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use rusqlite::{Connection, ErrorCode, Row, params};
use tokio::task;
use tracing::{debug, info};

use crate::domain::PersistentEntry;
use crate::ports::{Clock, EntryStore, StoreError, SystemClock};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_entries (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    owner         TEXT    NOT NULL,
    external_id   TEXT    NOT NULL,
    payload       TEXT    NOT NULL,
    creation_time INTEGER NOT NULL,
    UNIQUE (owner, external_id)
);
CREATE INDEX IF NOT EXISTS idx_queue_entries_owner_creation
    ON queue_entries (owner, creation_time, id);
";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub struct SqliteEntryStore<C = SystemClock> {
    conn: Arc<Mutex<Connection>>,
    clock: C,
}

impl SqliteEntryStore<SystemClock> {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened sqlite entry store");
        Self::from_connection(conn, SystemClock)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, SystemClock)
    }
}

impl<C: Clock> SqliteEntryStore<C> {
    pub fn from_connection(conn: Connection, clock: C) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::LockPoisoned(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[async_trait]
impl<C: Clock> EntryStore for SqliteEntryStore<C> {
    async fn insert_entry(
        &self,
        owner: &str,
        external_id: &str,
        payload: &str,
    ) -> Result<i64, StoreError> {
        let owner = owner.to_string();
        let external_id = external_id.to_string();
        let payload = payload.to_string();
        let created = self.clock.now().timestamp_micros();

        self.with_connection(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO queue_entries (owner, external_id, payload, creation_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![&owner, &external_id, &payload, created],
            );

            match inserted {
                Ok(_) => {
                    let id = conn.last_insert_rowid();
                    debug!(%owner, %external_id, id, "inserted entry");
                    Ok(id)
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Duplicate { owner, external_id })
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn delete_entry(&self, owner: &str, external_id: &str) -> Result<u64, StoreError> {
        let owner = owner.to_string();
        let external_id = external_id.to_string();

        self.with_connection(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM queue_entries WHERE owner = ?1 AND external_id = ?2",
                params![&owner, &external_id],
            )?;
            debug!(%owner, %external_id, deleted, "deleted entry");
            Ok(deleted as u64)
        })
        .await
    }

    async fn delete_entry_by_id(&self, owner: &str, internal_id: i64) -> Result<u64, StoreError> {
        let owner = owner.to_string();

        self.with_connection(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM queue_entries WHERE owner = ?1 AND id = ?2",
                params![&owner, internal_id],
            )?;
            debug!(%owner, internal_id, deleted, "deleted entry by id");
            Ok(deleted as u64)
        })
        .await
    }

    async fn list_entries_by_owner(&self, owner: &str) -> Result<Vec<PersistentEntry>, StoreError> {
        let owner = owner.to_string();

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner, external_id, payload, creation_time
                 FROM queue_entries
                 WHERE owner = ?1
                 ORDER BY creation_time ASC, id ASC",
            )?;
            let entries = stmt
                .query_map(params![&owner], map_entry_row)?
                .collect::<Result<Vec<_>, _>>()?;
            debug!(%owner, count = entries.len(), "listed entries");
            Ok(entries)
        })
        .await
    }
}

fn map_entry_row(row: &Row) -> rusqlite::Result<PersistentEntry> {
    let micros: i64 = row.get(4)?;
    let creation_time = DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, micros))?;

    Ok(PersistentEntry {
        internal_id: row.get(0)?,
        owner: row.get(1)?,
        external_id: row.get(2)?,
        payload: row.get(3)?,
        creation_time,
    })
}
