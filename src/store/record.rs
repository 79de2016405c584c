use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// One observation to persist. `(entity_id, observed_at)` is the natural
/// key: the store never holds two records with the same pair, and replaying
/// a record is a counted no-op rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity_id: String,
    pub observed_at: String,
    pub payload: Value,
}

impl Record {
    pub fn new(
        entity_id: impl Into<String>,
        observed_at: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            observed_at: observed_at.into(),
            payload,
        }
    }
}

/// Counters returned by an idempotent bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

/// Storage seam for handlers. A `domain` names an isolated keyspace (one
/// table per domain in the SQLite implementation).
pub trait RecordStore: Send + Sync + 'static {
    /// Writes each record unless its key already exists in the domain.
    fn write_if_absent<'a>(
        &'a self,
        domain: &'a str,
        records: Vec<Record>,
    ) -> StoreFuture<'a, WriteOutcome>;

    /// Point lookup by natural key.
    fn contains<'a>(
        &'a self,
        domain: &'a str,
        entity_id: &'a str,
        observed_at: &'a str,
    ) -> StoreFuture<'a, bool>;

    /// The most recent `limit` records for one entity, oldest first.
    /// Signal monitors read persisted quote history through this.
    fn recent_records<'a>(
        &'a self,
        domain: &'a str,
        entity_id: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Record>>;
}
