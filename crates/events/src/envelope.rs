use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use civitas_core::AggregateRef;

use crate::event::Event;

/// Envelope for an event on its way into the outbox.
///
/// This is the unit a command appends through its transaction handle. The
/// payload is already serialized, so the outbox never needs the concrete type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    name: String,
    payload: JsonValue,
    aggregate: AggregateRef,
    created_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(
        name: impl Into<String>,
        payload: JsonValue,
        aggregate: AggregateRef,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            payload,
            aggregate,
            created_at,
        }
    }

    /// Serialize a typed event into an envelope.
    pub fn from_event<E: Event>(event: &E, created_at: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            E::NAME,
            serde_json::to_value(event)?,
            event.aggregate(),
            created_at,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn aggregate(&self) -> &AggregateRef {
        &self.aggregate
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is<E: Event>(&self) -> bool {
        self.name == E::NAME
    }

    /// Decode the payload back into its typed event.
    pub fn decode<E: Event>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }
}
