//! Ports - seams to the outside world.
//!
//! The queue depends on these traits only; adapters live in [`crate::impls`].

pub mod clock;
pub mod entry_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::entry_store::{EntryStore, StoreError};
