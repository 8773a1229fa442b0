//! tenacious-core
//!
//! Durable retry queue: every pushed request is handed to a handler until
//! the handler reports success or the request is removed, and unfinished
//! requests survive restarts through an entry store.
//!
//! # Modules
//! - **domain**: `Request`, `PersistentEntry`, `Ticket`
//! - **queue**: `QueueCore` (pending list, retry schedule, request states)
//! - **worker**: dispatcher, retry scheduler and worker pool behind `RunHandle`
//! - **app**: `DurableQueue`, the core bound to one owner of an `EntryStore`
//! - **ports**: `EntryStore`, `Clock`
//! - **impls**: `InMemoryEntryStore`, `SqliteEntryStore`

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod worker;

pub use app::{DurableQueue, PayloadHandler, handler_fn};
pub use config::QueueConfig;
pub use domain::{PersistentEntry, Request};
pub use error::QueueError;
pub use observability::QueueCounts;
pub use ports::{EntryStore, StoreError};
pub use queue::{QueueCore, RequestHandler};
pub use worker::RunHandle;
