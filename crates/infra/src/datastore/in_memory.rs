use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::Value as JsonValue;

use civitas_events::{EventEnvelope, OutboxId, OutboxRecord, ProcessOutcome};

use super::{DataStore, FailureRecord, OutboxStore, StoreError, StoreResult, Transaction};

type RowKey = (String, String);

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, BTreeMap<String, JsonValue>>,
    /// Last write version per key; survives deletes so stale reads are caught.
    versions: HashMap<RowKey, u64>,
    clock: u64,
    outbox: Vec<OutboxRecord>,
    processed: HashMap<String, BTreeMap<OutboxId, ProcessOutcome>>,
    failures: HashMap<(String, OutboxId), FailureRecord>,
}

impl State {
    fn version_of(&self, table: &str, key: &str) -> u64 {
        self.versions
            .get(&(table.to_string(), key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn bump(&mut self, table: &str, key: &str) {
        self.clock += 1;
        self.versions
            .insert((table.to_string(), key.to_string()), self.clock);
    }

    fn contains(&self, table: &str, key: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|rows| rows.contains_key(key))
    }
}

/// In-memory datastore.
///
/// Intended for tests/dev. Transactions buffer their writes and apply them
/// atomically under a single write lock at commit, after checking that no key
/// they read has changed since (optimistic concurrency on point reads).
/// Range scans are not tracked for conflicts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed outbox record, in id order.
    pub fn outbox(&self) -> StoreResult<Vec<OutboxRecord>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.outbox.clone())
    }
}

impl OutboxStore for InMemoryDataStore {
    fn fetch_unprocessed(&self, consumer: &str, names: &[&str], limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        let processed = state.processed.get(consumer);

        Ok(state
            .outbox
            .iter()
            .filter(|r| names.contains(&r.name()))
            .filter(|r| !processed.is_some_and(|p| p.contains_key(&r.id)))
            .take(limit)
            .cloned()
            .collect())
    }

    fn record_failure(&self, consumer: &str, id: OutboxId, error: &str) -> StoreResult<u32> {
        let mut state = self.state.write().map_err(|_| StoreError::Poisoned)?;
        let now = Utc::now();
        let entry = state
            .failures
            .entry((consumer.to_string(), id))
            .and_modify(|f| {
                f.attempts += 1;
                f.last_error = error.to_string();
                f.last_failed_at = now;
            })
            .or_insert_with(|| FailureRecord {
                consumer: consumer.to_string(),
                outbox_id: id,
                attempts: 1,
                last_error: error.to_string(),
                last_failed_at: now,
            });
        Ok(entry.attempts)
    }

    fn dead_letters(&self, consumer: &str) -> StoreResult<Vec<FailureRecord>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        let Some(processed) = state.processed.get(consumer) else {
            return Ok(Vec::new());
        };
        Ok(processed
            .iter()
            .filter(|(_, outcome)| **outcome == ProcessOutcome::DeadLettered)
            .filter_map(|(id, _)| state.failures.get(&(consumer.to_string(), *id)).cloned())
            .collect())
    }

    fn processed_outcome(&self, consumer: &str, id: OutboxId) -> StoreResult<Option<ProcessOutcome>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state
            .processed
            .get(consumer)
            .and_then(|p| p.get(&id))
            .copied())
    }

    fn outbox_len(&self) -> StoreResult<u64> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.outbox.len() as u64)
    }
}

impl DataStore for InMemoryDataStore {
    fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        Ok(Box::new(InMemoryTransaction::new(self.state.clone())))
    }

    fn read(&self, table: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    fn read_scan(&self, table: &str, prefix: &str) -> StoreResult<Vec<(String, JsonValue)>> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn count(&self, table: &str) -> StoreResult<u64> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.tables.get(table).map_or(0, |rows| rows.len() as u64))
    }

    fn count_all(&self) -> StoreResult<u64> {
        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        Ok(state.tables.values().map(|rows| rows.len() as u64).sum())
    }
}

/// Buffered transaction over [`InMemoryDataStore`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<RwLock<State>>,
    /// `None` marks a delete.
    writes: HashMap<String, BTreeMap<String, Option<JsonValue>>>,
    truncated: HashSet<String>,
    inserted: Vec<RowKey>,
    reads: HashMap<RowKey, u64>,
    events: Vec<EventEnvelope>,
    marks: Vec<(String, OutboxId, ProcessOutcome)>,
    resets: Vec<String>,
}

impl InMemoryTransaction {
    fn new(state: Arc<RwLock<State>>) -> Self {
        Self {
            state,
            writes: HashMap::new(),
            truncated: HashSet::new(),
            inserted: Vec::new(),
            reads: HashMap::new(),
            events: Vec::new(),
            marks: Vec::new(),
            resets: Vec::new(),
        }
    }

    fn write(&mut self, table: &str, key: &str, value: Option<JsonValue>) {
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

impl Transaction for InMemoryTransaction {
    fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<JsonValue>> {
        if let Some(buffered) = self.writes.get(table).and_then(|rows| rows.get(key)) {
            return Ok(buffered.clone());
        }
        if self.truncated.contains(table) {
            return Ok(None);
        }

        let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
        self.reads
            .entry((table.to_string(), key.to_string()))
            .or_insert_with(|| state.version_of(table, key));
        Ok(state.tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    fn scan(&mut self, table: &str, prefix: &str) -> StoreResult<Vec<(String, JsonValue)>> {
        let mut merged: BTreeMap<String, JsonValue> = BTreeMap::new();

        if !self.truncated.contains(table) {
            let state = self.state.read().map_err(|_| StoreError::Poisoned)?;
            if let Some(rows) = state.tables.get(table) {
                merged.extend(
                    rows.range(prefix.to_string()..)
                        .take_while(|(k, _)| k.starts_with(prefix))
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
        }

        if let Some(rows) = self.writes.get(table) {
            for (key, value) in rows.iter().filter(|(k, _)| k.starts_with(prefix)) {
                match value {
                    Some(v) => merged.insert(key.clone(), v.clone()),
                    None => merged.remove(key),
                };
            }
        }

        Ok(merged.into_iter().collect())
    }

    fn put(&mut self, table: &str, key: &str, value: JsonValue) -> StoreResult<()> {
        self.write(table, key, Some(value));
        Ok(())
    }

    fn insert(&mut self, table: &str, key: &str, value: JsonValue) -> StoreResult<bool> {
        if self.get(table, key)?.is_some() {
            return Ok(false);
        }
        self.write(table, key, Some(value));
        self.inserted.push((table.to_string(), key.to_string()));
        Ok(true)
    }

    fn delete(&mut self, table: &str, key: &str) -> StoreResult<bool> {
        let existed = self.get(table, key)?.is_some();
        self.write(table, key, None);
        Ok(existed)
    }

    fn truncate(&mut self, table: &str) -> StoreResult<()> {
        self.writes.remove(table);
        self.inserted.retain(|(t, _)| t != table);
        self.truncated.insert(table.to_string());
        Ok(())
    }

    fn append(&mut self, envelope: EventEnvelope) -> StoreResult<()> {
        self.events.push(envelope);
        Ok(())
    }

    fn mark_processed(&mut self, consumer: &str, id: OutboxId, outcome: ProcessOutcome) -> StoreResult<()> {
        self.marks.push((consumer.to_string(), id, outcome));
        Ok(())
    }

    fn reset_consumer(&mut self, consumer: &str) -> StoreResult<()> {
        self.marks.retain(|(c, _, _)| c != consumer);
        self.resets.push(consumer.to_string());
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<Vec<OutboxId>> {
        let this = *self;
        let mut state = this.state.write().map_err(|_| StoreError::Poisoned)?;

        for (table, key) in &this.inserted {
            if !this.truncated.contains(table) && state.contains(table, key) {
                return Err(StoreError::UniqueViolation {
                    table: table.clone(),
                    key: key.clone(),
                });
            }
        }
        for ((table, key), seen) in &this.reads {
            if state.version_of(table, key) != *seen {
                return Err(StoreError::Conflict(format!("{table}/{key}")));
            }
        }

        for table in &this.truncated {
            if let Some(rows) = state.tables.remove(table) {
                for key in rows.keys() {
                    state.bump(table, key);
                }
            }
        }
        for (table, rows) in this.writes {
            for (key, value) in rows {
                state.bump(&table, &key);
                let target = state.tables.entry(table.clone()).or_default();
                match value {
                    Some(v) => {
                        target.insert(key, v);
                    }
                    None => {
                        target.remove(&key);
                    }
                }
            }
        }

        for consumer in &this.resets {
            state.processed.remove(consumer);
            state.failures.retain(|(c, _), _| c != consumer);
        }
        for (consumer, id, outcome) in this.marks {
            if outcome == ProcessOutcome::Applied {
                state.failures.remove(&(consumer.clone(), id));
            }
            state
                .processed
                .entry(consumer)
                .or_default()
                .entry(id)
                .or_insert(outcome);
        }

        let mut ids = Vec::with_capacity(this.events.len());
        for envelope in this.events {
            let id = OutboxId::new(state.outbox.len() as i64 + 1);
            state.outbox.push(OutboxRecord::new(id, envelope));
            ids.push(id);
        }
        Ok(ids)
    }

    fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use civitas_core::AggregateRef;

    use super::*;

    fn envelope(name: &str) -> EventEnvelope {
        EventEnvelope::new(name, json!({}), AggregateRef::new("test", "1"), Utc::now())
    }

    #[test]
    fn reads_observe_own_writes_before_commit() {
        let store = InMemoryDataStore::new();
        let mut tx = store.begin().unwrap();
        tx.put("users", "u1", json!({ "name": "ada" })).unwrap();

        assert_eq!(tx.get("users", "u1").unwrap(), Some(json!({ "name": "ada" })));
        assert_eq!(store.read("users", "u1").unwrap(), None);

        tx.commit().unwrap();
        assert_eq!(store.read("users", "u1").unwrap(), Some(json!({ "name": "ada" })));
    }

    #[test]
    fn rollback_discards_state_and_outbox_together() {
        let store = InMemoryDataStore::new();
        let mut tx = store.begin().unwrap();
        tx.put("users", "u1", json!(1)).unwrap();
        tx.append(envelope("UserRegistered")).unwrap();
        tx.rollback().unwrap();

        assert_eq!(store.count_all().unwrap(), 0);
        assert_eq!(store.outbox_len().unwrap(), 0);
    }

    #[test]
    fn dropped_transaction_leaves_no_footprint() {
        let store = InMemoryDataStore::new();
        {
            let mut tx = store.begin().unwrap();
            tx.put("users", "u1", json!(1)).unwrap();
            tx.append(envelope("UserRegistered")).unwrap();
        }
        assert_eq!(store.count_all().unwrap(), 0);
        assert_eq!(store.outbox_len().unwrap(), 0);
    }

    #[test]
    fn commit_assigns_monotonic_ids_in_append_order() {
        let store = InMemoryDataStore::new();
        let mut tx = store.begin().unwrap();
        tx.append(envelope("A")).unwrap();
        tx.append(envelope("B")).unwrap();
        let first = tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.append(envelope("C")).unwrap();
        let second = tx.commit().unwrap();

        assert_eq!(first, vec![OutboxId::new(1), OutboxId::new(2)]);
        assert_eq!(second, vec![OutboxId::new(3)]);
        let names: Vec<String> = store
            .outbox()
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, ["A", "B", "C"]);
    }

    #[test]
    fn insert_reports_existing_keys_and_racing_inserts_fail_at_commit() {
        let store = InMemoryDataStore::new();

        let mut a = store.begin().unwrap();
        let mut b = store.begin().unwrap();
        assert!(a.insert("xp_log", "k", json!(1)).unwrap());
        assert!(b.insert("xp_log", "k", json!(2)).unwrap());

        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(StoreError::UniqueViolation { .. })));

        let mut c = store.begin().unwrap();
        assert!(!c.insert("xp_log", "k", json!(3)).unwrap());
        assert_eq!(store.read("xp_log", "k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn stale_read_modify_write_is_rejected() {
        let store = InMemoryDataStore::new();
        let mut seed = store.begin().unwrap();
        seed.put("counters", "c", json!(0)).unwrap();
        seed.commit().unwrap();

        let mut a = store.begin().unwrap();
        let mut b = store.begin().unwrap();
        a.get("counters", "c").unwrap();
        b.get("counters", "c").unwrap();
        a.put("counters", "c", json!(1)).unwrap();
        b.put("counters", "c", json!(1)).unwrap();

        a.commit().unwrap();
        assert_eq!(b.commit(), Err(StoreError::Conflict("counters/c".into())));
    }

    #[test]
    fn scan_merges_buffered_writes_over_committed_rows() {
        let store = InMemoryDataStore::new();
        let mut seed = store.begin().unwrap();
        seed.put("m", "c1/u1", json!(1)).unwrap();
        seed.put("m", "c1/u2", json!(2)).unwrap();
        seed.put("m", "c2/u1", json!(3)).unwrap();
        seed.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.delete("m", "c1/u1").unwrap();
        tx.put("m", "c1/u3", json!(4)).unwrap();

        let keys: Vec<String> = tx.scan("m", "c1/").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["c1/u2", "c1/u3"]);
    }

    #[test]
    fn truncate_then_write_keeps_only_new_rows() {
        let store = InMemoryDataStore::new();
        let mut seed = store.begin().unwrap();
        seed.put("stats", "a", json!(1)).unwrap();
        seed.put("stats", "b", json!(1)).unwrap();
        seed.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.truncate("stats").unwrap();
        assert_eq!(tx.get("stats", "a").unwrap(), None);
        assert!(tx.insert("stats", "a", json!(2)).unwrap());
        tx.commit().unwrap();

        assert_eq!(store.count("stats").unwrap(), 1);
        assert_eq!(store.read("stats", "a").unwrap(), Some(json!(2)));
    }

    #[test]
    fn processed_marks_are_per_consumer() {
        let store = InMemoryDataStore::new();
        let mut tx = store.begin().unwrap();
        tx.append(envelope("E")).unwrap();
        let ids = tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.mark_processed("a", ids[0], ProcessOutcome::Applied).unwrap();
        tx.commit().unwrap();

        assert!(store.fetch_unprocessed("a", &["E"], 10).unwrap().is_empty());
        assert_eq!(store.fetch_unprocessed("b", &["E"], 10).unwrap().len(), 1);
        assert!(store.fetch_unprocessed("b", &["Other"], 10).unwrap().is_empty());
    }

    #[test]
    fn failures_accumulate_and_reset_clears_them() {
        let store = InMemoryDataStore::new();
        let id = OutboxId::new(1);
        assert_eq!(store.record_failure("p", id, "boom").unwrap(), 1);
        assert_eq!(store.record_failure("p", id, "boom again").unwrap(), 2);

        let mut tx = store.begin().unwrap();
        tx.mark_processed("p", id, ProcessOutcome::DeadLettered).unwrap();
        tx.commit().unwrap();

        let dead = store.dead_letters("p").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].last_error, "boom again");

        let mut tx = store.begin().unwrap();
        tx.reset_consumer("p").unwrap();
        tx.commit().unwrap();
        assert!(store.dead_letters("p").unwrap().is_empty());
        assert_eq!(store.processed_outcome("p", id).unwrap(), None);
    }
}
