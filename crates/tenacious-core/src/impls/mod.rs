//! Impls - adapters for the ports.
//!
//! - **InMemoryEntryStore**: development / test store
//! - **SqliteEntryStore**: durable store backed by SQLite

pub mod inmem_store;
pub mod sqlite_store;

pub use self::inmem_store::InMemoryEntryStore;
pub use self::sqlite_store::SqliteEntryStore;
