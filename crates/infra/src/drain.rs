//! Per-consumer outbox drain.
//!
//! For each registered consumer the dispatcher fetches the records it has not
//! yet marked, in id order, and hands them to the consumer one at a time.
//! Every record gets its own transaction: the consumer's effect and its
//! processed mark commit together or not at all.
//!
//! ## Failures
//!
//! A failing record is rolled back, its attempt counter is bumped, and the
//! drain of **that consumer** stops so later records are not applied ahead
//! of it. Other consumers are unaffected. The next drain retries it.
//!
//! With `max_attempts` configured, a record that has failed that many times
//! is marked dead-lettered for its consumer and the drain moves past it.
//! Without it (the default) retry is unbounded.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use civitas_auth::SystemActor;
use civitas_events::{BusError, CommitNotice, EventBus, OutboxId, OutboxRecord, ProcessOutcome};

use crate::config::DrainConfig;
use crate::datastore::DataStore;
use crate::error::{DrainError, PolicyError};
use crate::policy::{Policy, PolicyContext, Projection};

/// Outcome of one drain pass over one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub consumer: &'static str,
    pub applied: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Record the consumer is stuck on, if the pass stopped at a failure.
    pub blocked_at: Option<OutboxId>,
    pub last_error: Option<String>,
}

impl DrainReport {
    fn new(consumer: &'static str) -> Self {
        Self {
            consumer,
            applied: 0,
            failed: 0,
            dead_lettered: 0,
            blocked_at: None,
            last_error: None,
        }
    }

    /// Records this pass moved past (applied or dead-lettered).
    pub fn progressed(&self) -> usize {
        self.applied + self.dead_lettered
    }
}

enum ConsumerKind {
    Policy,
    Projection { tables: &'static [&'static str] },
}

struct Consumer {
    policy: Arc<dyn Policy>,
    kind: ConsumerKind,
    system: SystemActor,
    /// Serializes drains of this consumer within the process.
    lock: Mutex<()>,
}

pub struct Dispatcher {
    store: Arc<dyn DataStore>,
    config: DrainConfig,
    consumers: BTreeMap<&'static str, Consumer>,
    order: Vec<&'static str>,
    notices: Option<Arc<dyn EventBus<CommitNotice, Error = BusError>>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DataStore>, config: DrainConfig) -> Self {
        Self {
            store,
            config,
            consumers: BTreeMap::new(),
            order: Vec::new(),
            notices: None,
        }
    }

    /// Announce events appended by policies so other workers wake up.
    pub fn with_notices(mut self, bus: Arc<dyn EventBus<CommitNotice, Error = BusError>>) -> Self {
        self.notices = Some(bus);
        self
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    pub fn register_policy(&mut self, policy: Arc<dyn Policy>) -> Result<(), DrainError> {
        self.insert(policy, ConsumerKind::Policy)
    }

    pub fn register_projection<P: Projection + 'static>(&mut self, projection: Arc<P>) -> Result<(), DrainError> {
        let tables = projection.tables();
        self.insert(projection, ConsumerKind::Projection { tables })
    }

    fn insert(&mut self, policy: Arc<dyn Policy>, kind: ConsumerKind) -> Result<(), DrainError> {
        let name = policy.name();
        if self.consumers.contains_key(name) {
            return Err(DrainError::DuplicateConsumer(name.to_string()));
        }
        self.consumers.insert(
            name,
            Consumer {
                policy,
                kind,
                system: SystemActor::for_policy(name),
                lock: Mutex::new(()),
            },
        );
        self.order.push(name);
        Ok(())
    }

    /// Consumer names in registration order.
    pub fn consumer_names(&self) -> &[&'static str] {
        &self.order
    }

    /// Drain one consumer until it runs out of records or hits a failure.
    pub fn drain(&self, consumer: &str) -> Result<DrainReport, DrainError> {
        let slot = self.consumer(consumer)?;
        let _guard = slot
            .lock
            .lock()
            .map_err(|_| DrainError::Poisoned(consumer.to_string()))?;
        self.drain_locked(slot)
    }

    /// Drain every consumer once, in registration order.
    ///
    /// A consumer that fails (or whose drain errors) does not stop the others.
    pub fn drain_all(&self) -> Vec<Result<DrainReport, DrainError>> {
        self.order.iter().map(|name| self.drain(name)).collect()
    }

    /// Repeat [`Dispatcher::drain_all`] until a pass makes no progress, so
    /// events emitted by policies are consumed too. Returns records applied.
    pub fn settle(&self, max_rounds: usize) -> Result<usize, DrainError> {
        let mut total = 0;
        for _ in 0..max_rounds {
            let mut progressed = 0;
            for report in self.drain_all() {
                progressed += report?.progressed();
            }
            if progressed == 0 {
                break;
            }
            total += progressed;
        }
        Ok(total)
    }

    /// Discard a projection's state and marks, then redrain from the first record.
    #[instrument(skip(self), err)]
    pub fn rebuild(&self, projection: &str) -> Result<DrainReport, DrainError> {
        let slot = self.consumer(projection)?;
        let ConsumerKind::Projection { tables } = slot.kind else {
            return Err(DrainError::NotAProjection(projection.to_string()));
        };
        let _guard = slot
            .lock
            .lock()
            .map_err(|_| DrainError::Poisoned(projection.to_string()))?;

        let mut tx = self.store.begin()?;
        for table in tables {
            tx.truncate(table)?;
        }
        tx.reset_consumer(slot.policy.name())?;
        tx.commit()?;
        info!(projection, tables = tables.len(), "projection reset; redraining");

        self.drain_locked(slot)
    }

    fn consumer(&self, name: &str) -> Result<&Consumer, DrainError> {
        self.consumers
            .get(name)
            .ok_or_else(|| DrainError::UnknownConsumer(name.to_string()))
    }

    fn drain_locked(&self, slot: &Consumer) -> Result<DrainReport, DrainError> {
        let name = slot.policy.name();
        let inputs = slot.policy.inputs();
        let batch_size = self.config.batch_size.max(1);
        let mut report = DrainReport::new(name);

        loop {
            let batch = self.store.fetch_unprocessed(name, inputs, batch_size)?;
            let exhausted = batch.len() < batch_size;

            for record in &batch {
                match self.apply(slot, record) {
                    Ok(()) => {
                        debug!(consumer = name, outbox_id = %record.id, event = record.name(), "applied");
                        report.applied += 1;
                    }
                    Err(err) => {
                        report.failed += 1;
                        report.last_error = Some(err.to_string());
                        let attempts = self.store.record_failure(name, record.id, &err.to_string())?;

                        if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                            self.dead_letter(name, record)?;
                            error!(
                                consumer = name,
                                outbox_id = %record.id,
                                event = record.name(),
                                attempts,
                                error = %err,
                                "record dead-lettered"
                            );
                            report.dead_lettered += 1;
                            continue;
                        }

                        warn!(
                            consumer = name,
                            outbox_id = %record.id,
                            event = record.name(),
                            attempts,
                            error = %err,
                            "policy failed; record left unprocessed"
                        );
                        report.blocked_at = Some(record.id);
                        return Ok(report);
                    }
                }
            }

            if exhausted {
                return Ok(report);
            }
        }
    }

    fn apply(&self, slot: &Consumer, record: &OutboxRecord) -> Result<(), PolicyError> {
        let mut tx = self.store.begin()?;
        let handled = {
            let mut ctx = PolicyContext::new(&mut *tx, &slot.system, record.id);
            slot.policy.handle(&mut ctx, record)
        };
        if let Err(err) = handled {
            if let Err(rollback_err) = tx.rollback() {
                warn!(consumer = slot.policy.name(), error = %rollback_err, "rollback failed");
            }
            return Err(err);
        }

        tx.mark_processed(slot.policy.name(), record.id, ProcessOutcome::Applied)?;
        let outbox_ids = tx.commit()?;

        if let (Some(bus), false) = (&self.notices, outbox_ids.is_empty()) {
            let notice = CommitNotice {
                source: slot.policy.name(),
                outbox_ids,
            };
            if let Err(err) = bus.publish(notice) {
                warn!(consumer = slot.policy.name(), error = ?err, "failed to publish commit notice");
            }
        }
        Ok(())
    }

    fn dead_letter(&self, consumer: &str, record: &OutboxRecord) -> Result<(), DrainError> {
        let mut tx = self.store.begin()?;
        tx.mark_processed(consumer, record.id, ProcessOutcome::DeadLettered)?;
        tx.commit()?;
        Ok(())
    }
}
