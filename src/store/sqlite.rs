use crate::store::record::{Record, RecordStore, StoreFuture, WriteOutcome};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task;

/// Keeps row-value IN lists comfortably under SQLite's bound-variable limit
/// (two variables per record).
const EXISTENCE_CHECK_CHUNK: usize = 400;

/// Durable record store over one long-lived SQLite connection.
///
/// The connection is opened once (WAL, busy timeout) and shared; every
/// domain gets its own table with a `UNIQUE(entity_id, observed_at)` index.
/// That constraint is the correctness boundary for deduplication; the bulk
/// existence pre-check only avoids pointless insert attempts.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("failed to open sqlite database at {}", path.as_ref().display())
        })?;
        configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        configure(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Total rows in a domain, mainly for tests and metrics.
    pub async fn count(&self, domain: &str) -> Result<u64> {
        let conn = self.conn.clone();
        let domain = domain.to_string();
        task::spawn_blocking(move || count_blocking(&conn, &domain))
            .await
            .context("store task panicked")?
    }
}

impl RecordStore for SqliteStore {
    fn write_if_absent<'a>(
        &'a self,
        domain: &'a str,
        records: Vec<Record>,
    ) -> StoreFuture<'a, WriteOutcome> {
        let conn = self.conn.clone();
        let domain = domain.to_string();
        Box::pin(async move {
            task::spawn_blocking(move || write_if_absent_blocking(&conn, &domain, records))
                .await
                .context("store task panicked")?
        })
    }

    fn contains<'a>(
        &'a self,
        domain: &'a str,
        entity_id: &'a str,
        observed_at: &'a str,
    ) -> StoreFuture<'a, bool> {
        let conn = self.conn.clone();
        let domain = domain.to_string();
        let entity_id = entity_id.to_string();
        let observed_at = observed_at.to_string();
        Box::pin(async move {
            task::spawn_blocking(move || contains_blocking(&conn, &domain, &entity_id, &observed_at))
                .await
                .context("store task panicked")?
        })
    }

    fn recent_records<'a>(
        &'a self,
        domain: &'a str,
        entity_id: &'a str,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Record>> {
        let conn = self.conn.clone();
        let domain = domain.to_string();
        let entity_id = entity_id.to_string();
        Box::pin(async move {
            task::spawn_blocking(move || recent_records_blocking(&conn, &domain, &entity_id, limit))
                .await
                .context("store task panicked")?
        })
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite connection")
}

/// Table names cannot travel as bound parameters, so domains are restricted
/// to identifier characters.
fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        bail!("store domain cannot be empty");
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        bail!("store domain {domain} must match [a-z0-9_]+");
    }
    Ok(())
}

fn ensure_domain(conn: &Connection, domain: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {domain} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            observed_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(entity_id, observed_at)
        );"
    ))
    .with_context(|| format!("failed to create table for domain {domain}"))
}

fn lock_conn(conn: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
}

fn write_if_absent_blocking(
    conn: &Arc<Mutex<Connection>>,
    domain: &str,
    records: Vec<Record>,
) -> Result<WriteOutcome> {
    validate_domain(domain)?;
    if records.is_empty() {
        return Ok(WriteOutcome::default());
    }

    let mut guard = lock_conn(conn)?;
    ensure_domain(&guard, domain)?;

    let tx = guard
        .transaction()
        .context("failed to begin write transaction")?;

    let existing = existing_keys(&tx, domain, &records)?;

    let created_at = Utc::now().to_rfc3339();
    let mut outcome = WriteOutcome::default();
    {
        let mut insert = tx
            .prepare(&format!(
                "INSERT OR IGNORE INTO {domain} (entity_id, observed_at, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)"
            ))
            .context("failed to prepare insert statement")?;

        for record in &records {
            let key = (record.entity_id.clone(), record.observed_at.clone());
            if existing.contains(&key) {
                outcome.skipped += 1;
                continue;
            }

            let payload = serde_json::to_string(&record.payload)
                .context("failed to serialize record payload")?;
            let changed = insert
                .execute(params![
                    record.entity_id,
                    record.observed_at,
                    payload,
                    created_at
                ])
                .with_context(|| {
                    format!(
                        "failed to insert record {}/{}",
                        record.entity_id, record.observed_at
                    )
                })?;

            // A zero change count means the unique constraint caught a
            // duplicate the pre-check missed (in-batch repeat or a race).
            if changed == 1 {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
    }

    tx.commit().context("failed to commit write transaction")?;
    Ok(outcome)
}

/// Bulk pre-check: one row-value IN query per chunk instead of a point
/// lookup per record.
fn existing_keys(
    conn: &Connection,
    domain: &str,
    records: &[Record],
) -> Result<HashSet<(String, String)>> {
    let mut existing = HashSet::new();

    for chunk in records.chunks(EXISTENCE_CHECK_CHUNK) {
        let placeholders = chunk
            .iter()
            .map(|_| "(?, ?)")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT entity_id, observed_at FROM {domain}
             WHERE (entity_id, observed_at) IN (VALUES {placeholders})"
        );

        let mut statement = conn
            .prepare(&sql)
            .context("failed to prepare existence check")?;
        let bindings = chunk
            .iter()
            .flat_map(|record| [record.entity_id.as_str(), record.observed_at.as_str()]);
        let mut rows = statement
            .query(params_from_iter(bindings))
            .context("failed to run existence check")?;

        while let Some(row) = rows.next().context("failed to read existence check row")? {
            existing.insert((row.get(0)?, row.get(1)?));
        }
    }

    Ok(existing)
}

fn contains_blocking(
    conn: &Arc<Mutex<Connection>>,
    domain: &str,
    entity_id: &str,
    observed_at: &str,
) -> Result<bool> {
    validate_domain(domain)?;
    let guard = lock_conn(conn)?;
    ensure_domain(&guard, domain)?;

    let found = guard
        .query_row(
            &format!(
                "SELECT EXISTS(
                    SELECT 1 FROM {domain} WHERE entity_id = ?1 AND observed_at = ?2
                )"
            ),
            params![entity_id, observed_at],
            |row| row.get::<_, bool>(0),
        )
        .context("failed to run point lookup")?;
    Ok(found)
}

fn recent_records_blocking(
    conn: &Arc<Mutex<Connection>>,
    domain: &str,
    entity_id: &str,
    limit: usize,
) -> Result<Vec<Record>> {
    validate_domain(domain)?;
    let guard = lock_conn(conn)?;
    ensure_domain(&guard, domain)?;

    let mut statement = guard
        .prepare(&format!(
            "SELECT entity_id, observed_at, payload FROM {domain}
             WHERE entity_id = ?1
             ORDER BY observed_at DESC
             LIMIT ?2"
        ))
        .context("failed to prepare history query")?;

    let mut rows = statement
        .query(params![entity_id, limit as i64])
        .context("failed to run history query")?;

    let mut records = Vec::new();
    while let Some(row) = rows.next().context("failed to read history row")? {
        let payload: String = row.get(2)?;
        records.push(Record {
            entity_id: row.get(0)?,
            observed_at: row.get(1)?,
            payload: serde_json::from_str(&payload)
                .context("failed to deserialize record payload")?,
        });
    }

    // The query walks newest-first for the LIMIT; callers want chronology.
    records.reverse();
    Ok(records)
}

fn count_blocking(conn: &Arc<Mutex<Connection>>, domain: &str) -> Result<u64> {
    validate_domain(domain)?;
    let guard = lock_conn(conn)?;
    ensure_domain(&guard, domain)?;

    let count = guard
        .query_row(&format!("SELECT COUNT(*) FROM {domain}"), [], |row| {
            row.get::<_, u64>(0)
        })
        .context("failed to count rows")?;
    Ok(count)
}
