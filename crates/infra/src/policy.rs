//! Outbox consumers.
//!
//! A [`Policy`] performs side effects for the events it subscribes to. A
//! [`Projection`] is a policy whose only effect is a derived read model that
//! can be thrown away and rebuilt by redraining the outbox from the start.
//!
//! Both are delivered every record **at least once**. A handler must leave
//! the same end state no matter how many times it sees a record; see
//! [`crate::idempotency`] for the accepted patterns.

use civitas_auth::SystemActor;
use civitas_events::{Event, OutboxId, OutboxRecord};

use crate::datastore::Transaction;
use crate::error::PolicyError;

pub trait Policy: Send + Sync {
    /// Stable consumer name; processed marks are stored under it.
    fn name(&self) -> &'static str;

    /// Event names this policy consumes.
    fn inputs(&self) -> &'static [&'static str];

    fn handle(&self, ctx: &mut PolicyContext<'_>, record: &OutboxRecord) -> Result<(), PolicyError>;
}

pub trait Projection: Policy {
    /// Tables owned by the projection, truncated on rebuild.
    fn tables(&self) -> &'static [&'static str];
}

/// Handed to a policy for one record.
///
/// The transaction is the one the record's processed mark will be written
/// through, so effects applied here commit together with the mark.
pub struct PolicyContext<'a> {
    tx: &'a mut dyn Transaction,
    system: &'a SystemActor,
    record_id: OutboxId,
}

impl<'a> PolicyContext<'a> {
    pub fn new(tx: &'a mut dyn Transaction, system: &'a SystemActor, record_id: OutboxId) -> Self {
        Self { tx, system, record_id }
    }

    pub fn tx(&mut self) -> &mut dyn Transaction {
        &mut *self.tx
    }

    /// System actor scoped to this policy, for invoking commands.
    pub fn system(&self) -> &SystemActor {
        self.system
    }

    pub fn record_id(&self) -> OutboxId {
        self.record_id
    }
}

/// Decode a record into its typed event.
pub fn decode<E: Event>(record: &OutboxRecord) -> Result<E, PolicyError> {
    record.envelope.decode::<E>().map_err(|source| PolicyError::Decode {
        event: record.name().to_string(),
        source,
    })
}
