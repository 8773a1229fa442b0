use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal handle for one enqueued request.
///
/// External IDs are chosen by callers and may repeat; tickets never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket(u64);

impl Ticket {
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// One unit of work: a caller-chosen ID plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub payload: String,

    /// Internal ID of the persisted entry backing this request, if any.
    /// The external ID can be reused once removed; this one cannot.
    pub entry_id: Option<i64>,
}

impl Request {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            entry_id: None,
        }
    }

    pub fn with_entry_id(mut self, entry_id: i64) -> Self {
        self.entry_id = Some(entry_id);
        self
    }
}
