//! Postgres-backed datastore.
//!
//! Application state lives in a single `records` table keyed by
//! `(table_name, key)` with a JSONB value. The outbox and the consumer
//! bookkeeping tables sit beside it in the same database, so one SQL
//! transaction covers state, events and processed marks.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Conflict` |
//! | Anything else | N/A | `Unavailable` |
//!
//! ## Row locking
//!
//! `FOR UPDATE` cannot lock a row that does not exist yet, so every keyed
//! access inside a transaction first takes a transaction-scoped advisory lock
//! on `(table_name, key)`. Read-modify-write cycles on the same key are then
//! serialized even when the row is absent. Lock-order inversions surface as
//! `40P01` and map to `Conflict`.
//!
//! ## Sync facade
//!
//! The rest of the core is synchronous. The store owns a small tokio runtime
//! and drives every query with `block_on`, so it must not be called from
//! inside another async runtime.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tokio::runtime::Runtime;
use tracing::instrument;

use civitas_core::AggregateRef;
use civitas_events::{EventEnvelope, OutboxId, OutboxRecord, ProcessOutcome};

use super::{DataStore, FailureRecord, OutboxStore, StoreError, StoreResult, Transaction};

/// Idempotent schema, applied statement by statement by [`PostgresDataStore::ensure_schema`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS records (
        table_name TEXT NOT NULL,
        key TEXT NOT NULL,
        value JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (table_name, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id BIGSERIAL PRIMARY KEY,
        event_name TEXT NOT NULL,
        event_payload JSONB NOT NULL,
        aggregate_kind TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS outbox_event_name_idx ON outbox (event_name, id)",
    // Outbox rows are append-only.
    "CREATE OR REPLACE RULE outbox_no_update AS ON UPDATE TO outbox DO INSTEAD NOTHING",
    "CREATE OR REPLACE RULE outbox_no_delete AS ON DELETE TO outbox DO INSTEAD NOTHING",
    r#"
    CREATE TABLE IF NOT EXISTS outbox_processed (
        consumer TEXT NOT NULL,
        outbox_id BIGINT NOT NULL REFERENCES outbox (id),
        outcome TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (consumer, outbox_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox_failures (
        consumer TEXT NOT NULL,
        outbox_id BIGINT NOT NULL REFERENCES outbox (id),
        attempts INTEGER NOT NULL,
        last_error TEXT NOT NULL,
        last_failed_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (consumer, outbox_id)
    )
    "#,
];

/// Postgres datastore. `Send + Sync`; clones share the pool and runtime.
#[derive(Debug, Clone)]
pub struct PostgresDataStore {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl PostgresDataStore {
    /// Build a private runtime and connect a pool to `database_url`.
    pub fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("civitas-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    pub fn ensure_schema(&self) -> StoreResult<()> {
        self.block_on(async {
            for statement in SCHEMA.iter().copied() {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("ensure_schema", e))?;
            }
            Ok::<(), StoreError>(())
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl OutboxStore for PostgresDataStore {
    #[instrument(skip(self, names), err)]
    fn fetch_unprocessed(&self, consumer: &str, names: &[&str], limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let rows = self
            .block_on(
                sqlx::query(
                    r#"
                    SELECT id, event_name, event_payload, aggregate_kind, aggregate_id, created_at
                    FROM outbox o
                    WHERE o.event_name = ANY($2)
                      AND NOT EXISTS (
                          SELECT 1 FROM outbox_processed p
                          WHERE p.consumer = $1 AND p.outbox_id = o.id
                      )
                    ORDER BY o.id ASC
                    LIMIT $3
                    "#,
                )
                .bind(consumer)
                .bind(&names)
                .bind(limit as i64)
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("fetch_unprocessed", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self, error), err)]
    fn record_failure(&self, consumer: &str, id: OutboxId, error: &str) -> StoreResult<u32> {
        let attempts: i32 = self
            .block_on(
                sqlx::query_scalar(
                    r#"
                    INSERT INTO outbox_failures (consumer, outbox_id, attempts, last_error, last_failed_at)
                    VALUES ($1, $2, 1, $3, NOW())
                    ON CONFLICT (consumer, outbox_id)
                    DO UPDATE SET
                        attempts = outbox_failures.attempts + 1,
                        last_error = EXCLUDED.last_error,
                        last_failed_at = EXCLUDED.last_failed_at
                    RETURNING attempts
                    "#,
                )
                .bind(consumer)
                .bind(id.value())
                .bind(error)
                .fetch_one(&self.pool),
            )
            .map_err(|e| map_sqlx_error("record_failure", e))?;

        Ok(attempts.max(0) as u32)
    }

    fn dead_letters(&self, consumer: &str) -> StoreResult<Vec<FailureRecord>> {
        let rows = self
            .block_on(
                sqlx::query(
                    r#"
                    SELECT f.consumer, f.outbox_id, f.attempts, f.last_error, f.last_failed_at
                    FROM outbox_failures f
                    JOIN outbox_processed p
                      ON p.consumer = f.consumer AND p.outbox_id = f.outbox_id
                    WHERE f.consumer = $1 AND p.outcome = 'dead_lettered'
                    ORDER BY f.outbox_id ASC
                    "#,
                )
                .bind(consumer)
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("dead_letters", e))?;

        rows.iter()
            .map(|row| {
                Ok(FailureRecord {
                    consumer: row.try_get("consumer").map_err(decode_error)?,
                    outbox_id: OutboxId::new(row.try_get("outbox_id").map_err(decode_error)?),
                    attempts: row.try_get::<i32, _>("attempts").map_err(decode_error)?.max(0) as u32,
                    last_error: row.try_get("last_error").map_err(decode_error)?,
                    last_failed_at: row.try_get("last_failed_at").map_err(decode_error)?,
                })
            })
            .collect()
    }

    fn processed_outcome(&self, consumer: &str, id: OutboxId) -> StoreResult<Option<ProcessOutcome>> {
        let outcome: Option<String> = self
            .block_on(
                sqlx::query_scalar(
                    "SELECT outcome FROM outbox_processed WHERE consumer = $1 AND outbox_id = $2",
                )
                .bind(consumer)
                .bind(id.value())
                .fetch_optional(&self.pool),
            )
            .map_err(|e| map_sqlx_error("processed_outcome", e))?;

        outcome
            .map(|s| {
                ProcessOutcome::parse(&s)
                    .ok_or_else(|| StoreError::Serialization(format!("unknown outcome '{s}'")))
            })
            .transpose()
    }

    fn outbox_len(&self) -> StoreResult<u64> {
        let count: i64 = self
            .block_on(sqlx::query_scalar("SELECT COUNT(*) FROM outbox").fetch_one(&self.pool))
            .map_err(|e| map_sqlx_error("outbox_len", e))?;
        Ok(count.max(0) as u64)
    }
}

impl DataStore for PostgresDataStore {
    fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let tx = self
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction {
            tx: Some(tx),
            runtime: self.runtime.clone(),
            appended: Vec::new(),
        }))
    }

    fn read(&self, table: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        self.block_on(
            sqlx::query_scalar("SELECT value FROM records WHERE table_name = $1 AND key = $2")
                .bind(table)
                .bind(key)
                .fetch_optional(&self.pool),
        )
        .map_err(|e| map_sqlx_error("read", e))
    }

    fn read_scan(&self, table: &str, prefix: &str) -> StoreResult<Vec<(String, JsonValue)>> {
        let rows = self
            .block_on(
                sqlx::query(
                    r#"
                    SELECT key, value FROM records
                    WHERE table_name = $1 AND left(key, length($2)) = $2
                    ORDER BY key ASC
                    "#,
                )
                .bind(table)
                .bind(prefix)
                .fetch_all(&self.pool),
            )
            .map_err(|e| map_sqlx_error("read_scan", e))?;
        rows.iter().map(key_value_from_row).collect()
    }

    fn count(&self, table: &str) -> StoreResult<u64> {
        let count: i64 = self
            .block_on(
                sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE table_name = $1")
                    .bind(table)
                    .fetch_one(&self.pool),
            )
            .map_err(|e| map_sqlx_error("count", e))?;
        Ok(count.max(0) as u64)
    }

    fn count_all(&self) -> StoreResult<u64> {
        let count: i64 = self
            .block_on(sqlx::query_scalar("SELECT COUNT(*) FROM records").fetch_one(&self.pool))
            .map_err(|e| map_sqlx_error("count_all", e))?;
        Ok(count.max(0) as u64)
    }
}

/// One SQL transaction. Dropping it without commit rolls back.
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    runtime: Arc<Runtime>,
    appended: Vec<OutboxId>,
}

impl PostgresTransaction {
    /// Split borrow of the runtime and the open connection.
    fn parts(&mut self) -> StoreResult<(&Runtime, &mut PgConnection)> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("transaction already finished".into()))?;
        Ok((self.runtime.as_ref(), &mut **tx))
    }

    fn take(&mut self) -> StoreResult<sqlx::Transaction<'static, Postgres>> {
        self.tx
            .take()
            .ok_or_else(|| StoreError::Unavailable("transaction already finished".into()))
    }
}

/// Serializes access to one `(table, key)` until the transaction ends.
async fn lock_key(conn: &mut PgConnection, table: &str, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
        .bind(table)
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        // sqlx queues the rollback and returns the connection to the pool by
        // spawning onto the current runtime, so one must be entered here.
        if let Some(tx) = self.tx.take() {
            let _guard = self.runtime.enter();
            drop(tx);
        }
    }
}

impl Transaction for PostgresTransaction {
    fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        let (runtime, conn) = self.parts()?;
        runtime
            .block_on(async {
                lock_key(&mut *conn, table, key).await?;
                sqlx::query_scalar("SELECT value FROM records WHERE table_name = $1 AND key = $2 FOR UPDATE")
                    .bind(table)
                    .bind(key)
                    .fetch_optional(&mut *conn)
                    .await
            })
            .map_err(|e| map_sqlx_error("get", e))
    }

    fn scan(&mut self, table: &str, prefix: &str) -> StoreResult<Vec<(String, JsonValue)>> {
        let (runtime, conn) = self.parts()?;
        let rows = runtime
            .block_on(
                sqlx::query(
                    r#"
                    SELECT key, value FROM records
                    WHERE table_name = $1 AND left(key, length($2)) = $2
                    ORDER BY key ASC
                    "#,
                )
                .bind(table)
                .bind(prefix)
                .fetch_all(conn),
            )
            .map_err(|e| map_sqlx_error("scan", e))?;
        rows.iter().map(key_value_from_row).collect()
    }

    fn put(&mut self, table: &str, key: &str, value: JsonValue) -> StoreResult<()> {
        let (runtime, conn) = self.parts()?;
        runtime
            .block_on(async {
                lock_key(&mut *conn, table, key).await?;
                sqlx::query(
                    r#"
                    INSERT INTO records (table_name, key, value)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (table_name, key)
                    DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
                    "#,
                )
                .bind(table)
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await
            })
            .map_err(|e| map_sqlx_error("put", e))?;
        Ok(())
    }

    fn insert(&mut self, table: &str, key: &str, value: JsonValue) -> StoreResult<bool> {
        let (runtime, conn) = self.parts()?;
        let result = runtime
            .block_on(async {
                lock_key(&mut *conn, table, key).await?;
                sqlx::query(
                    r#"
                    INSERT INTO records (table_name, key, value)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (table_name, key) DO NOTHING
                    "#,
                )
                .bind(table)
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await
            })
            .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(result.rows_affected() == 1)
    }

    fn delete(&mut self, table: &str, key: &str) -> StoreResult<bool> {
        let (runtime, conn) = self.parts()?;
        let result = runtime
            .block_on(async {
                lock_key(&mut *conn, table, key).await?;
                sqlx::query("DELETE FROM records WHERE table_name = $1 AND key = $2")
                    .bind(table)
                    .bind(key)
                    .execute(&mut *conn)
                    .await
            })
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    fn truncate(&mut self, table: &str) -> StoreResult<()> {
        let (runtime, conn) = self.parts()?;
        runtime
            .block_on(
                sqlx::query("DELETE FROM records WHERE table_name = $1")
                    .bind(table)
                    .execute(conn),
            )
            .map_err(|e| map_sqlx_error("truncate", e))?;
        Ok(())
    }

    fn append(&mut self, envelope: EventEnvelope) -> StoreResult<()> {
        let (runtime, conn) = self.parts()?;
        let id: i64 = runtime
            .block_on(
                sqlx::query_scalar(
                    r#"
                    INSERT INTO outbox (event_name, event_payload, aggregate_kind, aggregate_id, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id
                    "#,
                )
                .bind(envelope.name())
                .bind(envelope.payload())
                .bind(&envelope.aggregate().kind)
                .bind(&envelope.aggregate().id)
                .bind(envelope.created_at())
                .fetch_one(conn),
            )
            .map_err(|e| map_sqlx_error("append", e))?;
        self.appended.push(OutboxId::new(id));
        Ok(())
    }

    fn mark_processed(&mut self, consumer: &str, id: OutboxId, outcome: ProcessOutcome) -> StoreResult<()> {
        let (runtime, conn) = self.parts()?;
        runtime
            .block_on(async {
                sqlx::query(
                    r#"
                    INSERT INTO outbox_processed (consumer, outbox_id, outcome)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (consumer, outbox_id) DO NOTHING
                    "#,
                )
                .bind(consumer)
                .bind(id.value())
                .bind(outcome.as_str())
                .execute(&mut *conn)
                .await?;

                if outcome == ProcessOutcome::Applied {
                    sqlx::query("DELETE FROM outbox_failures WHERE consumer = $1 AND outbox_id = $2")
                        .bind(consumer)
                        .bind(id.value())
                        .execute(&mut *conn)
                        .await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .map_err(|e| map_sqlx_error("mark_processed", e))
    }

    fn reset_consumer(&mut self, consumer: &str) -> StoreResult<()> {
        let (runtime, conn) = self.parts()?;
        runtime
            .block_on(async {
                sqlx::query("DELETE FROM outbox_processed WHERE consumer = $1")
                    .bind(consumer)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("DELETE FROM outbox_failures WHERE consumer = $1")
                    .bind(consumer)
                    .execute(&mut *conn)
                    .await?;
                Ok::<(), sqlx::Error>(())
            })
            .map_err(|e| map_sqlx_error("reset_consumer", e))
    }

    #[instrument(skip(self), fields(appended = self.appended.len()), err)]
    fn commit(mut self: Box<Self>) -> StoreResult<Vec<OutboxId>> {
        let tx = self.take()?;
        self.runtime
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(std::mem::take(&mut self.appended))
    }

    fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        let tx = self.take()?;
        self.runtime
            .block_on(tx.rollback())
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn record_from_row(row: &PgRow) -> StoreResult<OutboxRecord> {
    let id: i64 = row.try_get("id").map_err(decode_error)?;
    let name: String = row.try_get("event_name").map_err(decode_error)?;
    let payload: JsonValue = row.try_get("event_payload").map_err(decode_error)?;
    let kind: String = row.try_get("aggregate_kind").map_err(decode_error)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(decode_error)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode_error)?;

    Ok(OutboxRecord::new(
        OutboxId::new(id),
        EventEnvelope::new(name, payload, AggregateRef::new(kind, aggregate_id), created_at),
    ))
}

fn key_value_from_row(row: &PgRow) -> StoreResult<(String, JsonValue)> {
    Ok((
        row.try_get("key").map_err(decode_error)?,
        row.try_get("value").map_err(decode_error)?,
    ))
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Serialization(format!("failed to decode row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("23505") => {
                return StoreError::UniqueViolation {
                    table: db.table().unwrap_or("records").to_string(),
                    key: db.constraint().unwrap_or("unknown").to_string(),
                };
            }
            Some("40001") | Some("40P01") => {
                return StoreError::Conflict(format!("{operation}: {}", db.message()));
            }
            _ => {}
        }
    }
    StoreError::Unavailable(format!("{operation}: {err}"))
}

/// These run against a live database: `DATABASE_URL=... cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, Once, mpsc};
    use std::thread;
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    static SCHEMA_READY: Once = Once::new();

    fn store(max_connections: u32) -> Option<PostgresDataStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PostgresDataStore::connect(&url, max_connections).unwrap();
        SCHEMA_READY.call_once(|| store.ensure_schema().unwrap());
        Some(store)
    }

    /// A table name no other test run touches.
    fn scratch(label: &str) -> String {
        format!("{label}_{}", uuid::Uuid::now_v7().simple())
    }

    #[test]
    #[ignore]
    fn dropped_transaction_rolls_back_and_frees_its_connection() {
        let Some(store) = store(1) else { return };
        let table = scratch("dropped");

        for _ in 0..3 {
            let mut tx = store.begin().unwrap();
            tx.put(&table, "k", json!({ "xp": 1 })).unwrap();
            drop(tx);
        }

        assert_eq!(store.read(&table, "k").unwrap(), None);
        let tx = store.begin().unwrap();
        tx.rollback().unwrap();
    }

    #[test]
    #[ignore]
    fn tier_persistence_for_unknown_users_fails_cleanly() {
        use civitas_auth::{AuthzError, Directory, TrustTier};
        use civitas_core::UserId;

        use crate::accounts::StoreDirectory;

        let Some(store) = store(1) else { return };
        let directory = StoreDirectory::new(Arc::new(store.clone()));

        assert_eq!(
            directory.persist_tier(UserId::new(), TrustTier::VerifiedWallet),
            Err(AuthzError::InvalidActor("unknown user".into()))
        );
        let tx = store.begin().unwrap();
        tx.rollback().unwrap();
    }

    #[test]
    #[ignore]
    fn read_modify_write_on_an_absent_row_is_serialized() {
        let Some(store) = store(4) else { return };
        let table = Arc::new(scratch("balances"));
        let (locked_tx, locked_rx) = mpsc::channel();

        let first = {
            let (store, table) = (store.clone(), table.clone());
            thread::spawn(move || {
                let mut tx = store.begin().unwrap();
                assert_eq!(tx.get(&table, "u").unwrap(), None);
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(200));
                tx.put(&table, "u", json!({ "xp": 10, "referral_xp": 0 })).unwrap();
                tx.commit().unwrap();
            })
        };

        locked_rx.recv().unwrap();
        let mut tx = store.begin().unwrap();
        let mut balance = tx.get(&table, "u").unwrap().unwrap_or(json!({ "xp": 0, "referral_xp": 0 }));
        balance["referral_xp"] = json!(1);
        tx.put(&table, "u", balance).unwrap();
        tx.commit().unwrap();
        first.join().unwrap();

        assert_eq!(
            store.read(&table, "u").unwrap(),
            Some(json!({ "xp": 10, "referral_xp": 1 }))
        );
    }

    #[test]
    #[ignore]
    fn racing_unique_inserts_admit_exactly_one() {
        let Some(store) = store(8) else { return };
        let table = Arc::new(scratch("markers"));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|n| {
                let (store, table, barrier) = (store.clone(), table.clone(), barrier.clone());
                thread::spawn(move || {
                    let mut tx = store.begin().unwrap();
                    barrier.wait();
                    let inserted = tx.insert(&table, "once", json!({ "by": n })).unwrap();
                    tx.commit().unwrap();
                    inserted
                })
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
        assert_eq!(store.count(&table).unwrap(), 1);
    }

    #[test]
    #[ignore]
    fn unprocessed_records_are_ordered_and_tracked_per_consumer() {
        let Some(store) = store(2) else { return };
        let event = scratch("Ping");
        let (a, b) = (scratch("consumer_a"), scratch("consumer_b"));

        let mut tx = store.begin().unwrap();
        for n in 0..3 {
            tx.append(EventEnvelope::new(
                event.clone(),
                json!({ "n": n }),
                AggregateRef::new("ping", n),
                Utc::now(),
            ))
            .unwrap();
        }
        let appended = tx.commit().unwrap();
        assert_eq!(appended.len(), 3);

        let fetched = store.fetch_unprocessed(&a, &[event.as_str()], 10).unwrap();
        let ids: Vec<i64> = fetched.iter().map(|r| r.id.value()).collect();
        assert_eq!(ids, appended.iter().map(|id| id.value()).collect::<Vec<_>>());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fetched[0].envelope.payload(), &json!({ "n": 0 }));

        let mut tx = store.begin().unwrap();
        tx.mark_processed(&a, appended[0], ProcessOutcome::Applied).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.fetch_unprocessed(&a, &[event.as_str()], 10).unwrap().len(), 2);
        assert_eq!(store.fetch_unprocessed(&b, &[event.as_str()], 10).unwrap().len(), 3);
        assert_eq!(store.processed_outcome(&a, appended[0]).unwrap(), Some(ProcessOutcome::Applied));
        assert_eq!(store.processed_outcome(&b, appended[0]).unwrap(), None);
    }
}
