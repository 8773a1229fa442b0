//! App - the durable queue built from the core and an entry store.

pub mod durable_queue;
pub mod handler;

pub use self::durable_queue::DurableQueue;
pub use self::handler::{FnHandler, PayloadHandler, handler_fn};
