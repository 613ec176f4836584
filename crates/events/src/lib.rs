//! `civitas-events` — event, envelope and outbox record types plus the
//! in-process commit notice bus.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod record;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{BusError, InMemoryEventBus};
pub use record::{CommitNotice, OutboxId, OutboxRecord, ProcessOutcome};

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use civitas_core::{AggregateRef, CommunityId};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Renamed {
        community_id: CommunityId,
        name: String,
    }

    impl Event for Renamed {
        const NAME: &'static str = "Renamed";

        fn aggregate(&self) -> AggregateRef {
            AggregateRef::community(self.community_id)
        }
    }

    #[test]
    fn envelope_keeps_name_and_aggregate_of_event() {
        let event = Renamed {
            community_id: CommunityId::new(),
            name: "rustaceans".into(),
        };
        let envelope = EventEnvelope::from_event(&event, Utc::now()).unwrap();

        assert!(envelope.is::<Renamed>());
        assert_eq!(envelope.aggregate(), &AggregateRef::community(event.community_id));
        assert_eq!(envelope.decode::<Renamed>().unwrap(), event);
    }

    #[test]
    fn decode_rejects_foreign_payload() {
        let envelope = EventEnvelope::new(
            "Renamed",
            serde_json::json!({ "unexpected": true }),
            AggregateRef::new("community", "x"),
            Utc::now(),
        );
        assert!(envelope.decode::<Renamed>().is_err());
    }

    #[test]
    fn bus_fans_out_commit_notices() {
        let bus = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let notice = CommitNotice {
            source: "CreateThread",
            outbox_ids: vec![OutboxId::new(1), OutboxId::new(2)],
        };
        bus.publish(notice.clone()).unwrap();

        assert_eq!(a.try_recv().unwrap(), notice);
        assert_eq!(b.try_recv().unwrap(), notice);
    }

    #[test]
    fn bus_drops_closed_subscriptions() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let live = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(7).unwrap();
        assert_eq!(live.try_recv().unwrap(), 7);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
