//! Durable mirror of a [`Request`](super::Request).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Request;

/// A persisted request, scoped by owner.
///
/// `internal_id` is the store's surrogate key and grows monotonically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentEntry {
    pub internal_id: i64,
    pub owner: String,
    pub external_id: String,
    pub payload: String,
    pub creation_time: DateTime<Utc>,
}

impl From<PersistentEntry> for Request {
    fn from(entry: PersistentEntry) -> Self {
        Request::new(entry.external_id, entry.payload).with_entry_id(entry.internal_id)
    }
}
