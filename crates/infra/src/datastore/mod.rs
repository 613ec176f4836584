//! Transactional datastore with a colocated outbox.
//!
//! Application state is stored as JSON documents in named tables keyed by
//! string. The outbox lives in the same store so that a single
//! [`Transaction`] can commit state mutations and event appends together:
//! either both become visible, or neither does.
//!
//! ## Consumer bookkeeping
//!
//! Outbox rows are never rewritten or deleted. Each consumer owns a
//! processed-set of `(consumer, outbox_id)` marks. Marks are written through
//! the same transaction as the consumer's effect, so an effect and its mark
//! commit together. Failure counters are kept outside transactions because
//! they must survive the rollback of the attempt they count.

pub mod in_memory;
pub mod postgres;

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use civitas_events::{EventEnvelope, OutboxId, OutboxRecord, ProcessOutcome};

pub use in_memory::InMemoryDataStore;
pub use postgres::PostgresDataStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique insert lost a race with a concurrent writer.
    #[error("unique violation on {table}/{key}")]
    UniqueViolation { table: String, key: String },

    /// A value read by this transaction changed before it could commit.
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Connection, pool or database failure. Safe to retry.
    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("datastore lock poisoned")]
    Poisoned,
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// A consumer's failure history for one outbox record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub consumer: String,
    pub outbox_id: OutboxId,
    pub attempts: u32,
    pub last_error: String,
    pub last_failed_at: DateTime<Utc>,
}

/// A unit of work against the datastore.
///
/// Reads observe the transaction's own writes. Dropping a transaction without
/// calling [`Transaction::commit`] discards every write, outbox appends
/// included.
pub trait Transaction: Send {
    fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<JsonValue>>;

    /// All rows whose key starts with `prefix`, ordered by key.
    fn scan(&mut self, table: &str, prefix: &str) -> StoreResult<Vec<(String, JsonValue)>>;

    fn put(&mut self, table: &str, key: &str, value: JsonValue) -> StoreResult<()>;

    /// Insert unless the key already exists. Returns `false` when it did.
    fn insert(&mut self, table: &str, key: &str, value: JsonValue) -> StoreResult<bool>;

    /// Returns `false` when there was nothing to delete.
    fn delete(&mut self, table: &str, key: &str) -> StoreResult<bool>;

    fn truncate(&mut self, table: &str) -> StoreResult<()>;

    /// Append an event to the outbox. Ids are assigned in append order.
    fn append(&mut self, envelope: EventEnvelope) -> StoreResult<()>;

    /// Mark a record as handled by `consumer`. Marking twice is a no-op.
    fn mark_processed(&mut self, consumer: &str, id: OutboxId, outcome: ProcessOutcome) -> StoreResult<()>;

    /// Forget every mark and failure counter of `consumer`.
    fn reset_consumer(&mut self, consumer: &str) -> StoreResult<()>;

    /// Commit and return the ids of the outbox records appended.
    fn commit(self: Box<Self>) -> StoreResult<Vec<OutboxId>>;

    fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Consumer-side view of the outbox.
pub trait OutboxStore: Send + Sync {
    /// Committed records named in `names` that `consumer` has not marked,
    /// ordered by id ascending.
    fn fetch_unprocessed(&self, consumer: &str, names: &[&str], limit: usize) -> StoreResult<Vec<OutboxRecord>>;

    /// Count a failed attempt outside any transaction; returns the new total.
    fn record_failure(&self, consumer: &str, id: OutboxId, error: &str) -> StoreResult<u32>;

    /// Records `consumer` gave up on.
    fn dead_letters(&self, consumer: &str) -> StoreResult<Vec<FailureRecord>>;

    fn processed_outcome(&self, consumer: &str, id: OutboxId) -> StoreResult<Option<ProcessOutcome>>;

    fn outbox_len(&self) -> StoreResult<u64>;
}

/// Handle passed explicitly to executors and policies.
pub trait DataStore: OutboxStore {
    fn begin(&self) -> StoreResult<Box<dyn Transaction>>;

    /// Committed value, read outside any transaction.
    fn read(&self, table: &str, key: &str) -> StoreResult<Option<JsonValue>>;

    fn read_scan(&self, table: &str, prefix: &str) -> StoreResult<Vec<(String, JsonValue)>>;

    /// Committed rows in `table`.
    fn count(&self, table: &str) -> StoreResult<u64>;

    /// Committed rows across every table.
    fn count_all(&self) -> StoreResult<u64>;
}

/// Typed view over a named table.
#[derive(Debug)]
pub struct Table<T> {
    name: &'static str,
    _row: PhantomData<fn() -> T>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Table<T> {}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned,
{
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _row: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, tx: &mut dyn Transaction, key: &str) -> StoreResult<Option<T>> {
        tx.get(self.name, key)?.map(decode).transpose()
    }

    pub fn scan(&self, tx: &mut dyn Transaction, prefix: &str) -> StoreResult<Vec<(String, T)>> {
        tx.scan(self.name, prefix)?
            .into_iter()
            .map(|(key, value)| Ok((key, decode(value)?)))
            .collect()
    }

    pub fn put(&self, tx: &mut dyn Transaction, key: &str, row: &T) -> StoreResult<()> {
        tx.put(self.name, key, serde_json::to_value(row)?)
    }

    pub fn insert(&self, tx: &mut dyn Transaction, key: &str, row: &T) -> StoreResult<bool> {
        tx.insert(self.name, key, serde_json::to_value(row)?)
    }

    pub fn delete(&self, tx: &mut dyn Transaction, key: &str) -> StoreResult<bool> {
        tx.delete(self.name, key)
    }

    pub fn read(&self, store: &dyn DataStore, key: &str) -> StoreResult<Option<T>> {
        store.read(self.name, key)?.map(decode).transpose()
    }

    pub fn read_scan(&self, store: &dyn DataStore, prefix: &str) -> StoreResult<Vec<(String, T)>> {
        store
            .read_scan(self.name, prefix)?
            .into_iter()
            .map(|(key, value)| Ok((key, decode(value)?)))
            .collect()
    }
}

fn decode<T: DeserializeOwned>(value: JsonValue) -> StoreResult<T> {
    Ok(serde_json::from_value(value)?)
}
