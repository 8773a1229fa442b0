//! Domain model: requests and their persisted form.

pub mod entry;
pub mod request;

pub use entry::PersistentEntry;
pub use request::{Request, Ticket};
