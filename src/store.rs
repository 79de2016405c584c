//! Idempotent record persistence keyed by a composite natural key.
//!
//! The `RecordStore` trait is the seam handlers write through; `SqliteStore`
//! is the durable implementation, `MemoryStore` backs tests.

pub mod memory;
pub mod record;
pub mod sqlite;

pub use memory::MemoryStore;
pub use record::{Record, RecordStore, StoreFuture, WriteOutcome};
pub use sqlite::SqliteStore;
