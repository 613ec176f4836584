//! Outbox rows as seen by consumers.

use serde::{Deserialize, Serialize};

use crate::envelope::EventEnvelope;

/// Monotonic outbox position. Assigned by the datastore, never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(i64);

impl OutboxId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A committed outbox row. Immutable after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: OutboxId,
    pub envelope: EventEnvelope,
}

impl OutboxRecord {
    pub fn new(id: OutboxId, envelope: EventEnvelope) -> Self {
        Self { id, envelope }
    }

    pub fn name(&self) -> &str {
        self.envelope.name()
    }
}

/// How a consumer finished with a record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// The handler ran and its effect committed.
    Applied,
    /// The handler kept failing past the configured attempt bound.
    DeadLettered,
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Applied => "applied",
            ProcessOutcome::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applied" => Some(ProcessOutcome::Applied),
            "dead_lettered" => Some(ProcessOutcome::DeadLettered),
            _ => None,
        }
    }
}

/// Published after a command commits so drain workers can wake early.
///
/// Carries ids only; consumers always re-read the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    pub source: &'static str,
    pub outbox_ids: Vec<OutboxId>,
}
