use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use futures::FutureExt;

use crate::store::record::{Record, RecordStore, StoreFuture, WriteOutcome};

type DomainMap = HashMap<String, HashMap<(String, String), Record>>;

/// In-memory record store used by handler tests and short-lived agents.
///
/// Writes are keyed by `(entity_id, observed_at)` per domain, matching the
/// uniqueness constraint of [`crate::store::SqliteStore`].
#[derive(Default, Clone)]
pub struct MemoryStore {
    domains: Arc<Mutex<DomainMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored under a domain.
    pub fn len(&self, domain: &str) -> usize {
        self.domains
            .lock()
            .expect("memory store mutex poisoned")
            .get(domain)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, domain: &str) -> bool {
        self.len(domain) == 0
    }

    fn lock_domains(&self) -> Result<std::sync::MutexGuard<'_, DomainMap>> {
        self.domains
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }
}

impl RecordStore for MemoryStore {
    fn write_if_absent<'a>(
        &'a self,
        domain: &'a str,
        records: Vec<Record>,
    ) -> StoreFuture<'a, WriteOutcome> {
        async move {
            let mut domains = self.lock_domains()?;
            let entries = domains.entry(domain.to_string()).or_default();

            let mut outcome = WriteOutcome::default();
            for record in records {
                let key = (record.entity_id.clone(), record.observed_at.clone());
                if entries.contains_key(&key) {
                    outcome.skipped += 1;
                } else {
                    entries.insert(key, record);
                    outcome.inserted += 1;
                }
            }

            Ok(outcome)
        }
        .boxed()
    }

    fn contains<'a>(
        &'a self,
        domain: &'a str,
        entity_id: &'a str,
        observed_at: &'a str,
    ) -> StoreFuture<'a, bool> {
        async move {
            let domains = self.lock_domains()?;
            Ok(domains
                .get(domain)
                .map(|records| {
                    records.contains_key(&(entity_id.to_string(), observed_at.to_string()))
                })
                .unwrap_or(false))
        }
        .boxed()
    }

    fn recent_records<'a>(
        &'a self,
        domain: &'a str,
        entity_id: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Record>> {
        async move {
            let domains = self.lock_domains()?;
            let mut matching: Vec<Record> = domains
                .get(domain)
                .map(|records| {
                    records
                        .values()
                        .filter(|record| record.entity_id == entity_id)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            matching.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));

            let skip = matching.len().saturating_sub(limit);
            Ok(matching.split_off(skip))
        }
        .boxed()
    }
}
