//! End-to-end tests for the command → outbox → drain pipeline.
//!
//! Verifies:
//! - state and events commit together or not at all
//! - a rejected actor leaves no trace
//! - each consumer sees records in order, at its own pace
//! - dead-lettering, rebuild and commit notices

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use civitas_auth::{Actor, AuthzError, Role, RequireRole, SystemActor, TrustTier, UserActor};
use civitas_core::{AggregateRef, CommunityId, UserId, Validate};
use civitas_events::{CommitNotice, Event, EventBus, InMemoryEventBus, OutboxId, OutboxRecord, ProcessOutcome};

use crate::accounts::StoreDirectory;
use crate::command::{CommandDescriptor, CommandExecutor, CommandRegistry};
use crate::config::DrainConfig;
use crate::datastore::{DataStore, InMemoryDataStore, OutboxStore, Table};
use crate::drain::Dispatcher;
use crate::error::{DrainError, OperationError, PolicyError};
use crate::policy::{self, Policy, PolicyContext, Projection};
use crate::workers::DrainWorker;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Bumped {
    key: String,
    seq: u32,
}

impl Event for Bumped {
    const NAME: &'static str = "Bumped";

    fn aggregate(&self) -> AggregateRef {
        AggregateRef::new("counter", &self.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bump {
    community_id: CommunityId,
    key: String,
    times: u32,
    #[serde(default)]
    fail_after_write: bool,
}

impl Validate for Bump {
    fn validate(&self) -> civitas_core::DomainResult<()> {
        civitas_core::require_text("key", &self.key, 32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Counter {
    value: u32,
}

impl Validate for Counter {}

const COUNTERS: Table<Counter> = Table::new("counters");
const TALLIES: Table<Counter> = Table::new("tallies");

fn bump_command() -> CommandDescriptor<Bump, Counter> {
    CommandDescriptor::new("bump", |ctx, input: Bump| {
        let current = COUNTERS.get(ctx.tx(), &input.key)?.unwrap_or(Counter { value: 0 });
        let next = Counter {
            value: current.value + input.times,
        };
        COUNTERS.put(ctx.tx(), &input.key, &next)?;
        for seq in 0..input.times {
            ctx.emit(&Bumped {
                key: input.key.clone(),
                seq,
            })?;
        }
        if input.fail_after_write {
            return Err(OperationError::invalid_state("forced failure"));
        }
        Ok(next)
    })
    .guard(RequireRole::new(Role::ANY, |input: &Bump| input.community_id))
}

/// Counts every `Bumped` per key. Not idempotent on its own: relies on the
/// processed marks committing with the count.
struct Tally;

impl Policy for Tally {
    fn name(&self) -> &'static str {
        "tally"
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[Bumped::NAME]
    }

    fn handle(&self, ctx: &mut PolicyContext<'_>, record: &OutboxRecord) -> Result<(), PolicyError> {
        let event: Bumped = policy::decode(record)?;
        let current = TALLIES.get(ctx.tx(), &event.key)?.unwrap_or(Counter { value: 0 });
        TALLIES.put(ctx.tx(), &event.key, &Counter { value: current.value + 1 })?;
        Ok(())
    }
}

impl Projection for Tally {
    fn tables(&self) -> &'static [&'static str] {
        &["tallies"]
    }
}

/// Records the ids it sees; fails the first `failures` attempts, or forever
/// on keys listed in `poison`.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<OutboxId>>,
    failures: AtomicUsize,
    poison: Vec<String>,
}

impl Recorder {
    fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    fn poisoned(key: &str) -> Self {
        Self {
            poison: vec![key.to_string()],
            ..Self::default()
        }
    }

    fn seen(&self) -> Vec<OutboxId> {
        self.seen.lock().unwrap().clone()
    }
}

impl Policy for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn inputs(&self) -> &'static [&'static str] {
        &[Bumped::NAME]
    }

    fn handle(&self, ctx: &mut PolicyContext<'_>, record: &OutboxRecord) -> Result<(), PolicyError> {
        let event: Bumped = policy::decode(record)?;
        if self.poison.contains(&event.key) {
            return Err(PolicyError::Upstream(format!("cannot handle {}", event.key)));
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PolicyError::Upstream("node timed out".into()));
        }
        assert_eq!(ctx.record_id(), record.id);
        self.seen.lock().unwrap().push(record.id);
        Ok(())
    }
}

struct Harness {
    store: Arc<InMemoryDataStore>,
    executor: CommandExecutor,
    bump: CommandDescriptor<Bump, Counter>,
    community_id: CommunityId,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryDataStore::new());
        let directory = Arc::new(StoreDirectory::new(store.clone()));
        Self {
            executor: CommandExecutor::new(store.clone(), directory),
            store,
            bump: bump_command(),
            community_id: CommunityId::new(),
        }
    }

    fn member(&self) -> Actor {
        let mut memberships = HashMap::new();
        memberships.insert(self.community_id, Role::Member);
        Actor::User(UserActor {
            user_id: UserId::new(),
            address: "0xabc".into(),
            is_super_admin: false,
            tier: TrustTier::VerifiedWallet,
            registered_at: Utc::now(),
            memberships,
        })
    }

    fn outsider(&self) -> Actor {
        Actor::User(UserActor {
            user_id: UserId::new(),
            address: "0xdef".into(),
            is_super_admin: false,
            tier: TrustTier::VerifiedWallet,
            registered_at: Utc::now(),
            memberships: HashMap::new(),
        })
    }

    fn bump(&self, key: &str, times: u32) -> Result<Counter, OperationError> {
        self.executor.execute(
            &self.bump,
            self.member(),
            Bump {
                community_id: self.community_id,
                key: key.into(),
                times,
                fail_after_write: false,
            },
        )
    }

    fn dispatcher(&self, config: DrainConfig) -> Dispatcher {
        Dispatcher::new(self.store.clone(), config)
    }
}

#[test]
fn command_commits_state_and_events_together() {
    let h = Harness::new();

    let counter = h.bump("likes", 3).unwrap();

    assert_eq!(counter, Counter { value: 3 });
    assert_eq!(COUNTERS.read(h.store.as_ref(), "likes").unwrap(), Some(counter));
    let outbox = h.store.outbox().unwrap();
    assert_eq!(outbox.len(), 3);
    assert!(outbox.iter().all(|r| r.name() == Bumped::NAME));
    assert_eq!(outbox[0].envelope.aggregate(), &AggregateRef::new("counter", "likes"));
}

#[test]
fn failure_after_mutation_rolls_back_state_and_events() {
    let h = Harness::new();
    h.bump("likes", 1).unwrap();
    let rows_before = h.store.count_all().unwrap();

    let err = h
        .executor
        .execute(
            &h.bump,
            h.member(),
            Bump {
                community_id: h.community_id,
                key: "likes".into(),
                times: 2,
                fail_after_write: true,
            },
        )
        .unwrap_err();

    assert_eq!(err, OperationError::InvalidState("forced failure".into()));
    assert_eq!(COUNTERS.read(h.store.as_ref(), "likes").unwrap(), Some(Counter { value: 1 }));
    assert_eq!(h.store.count_all().unwrap(), rows_before);
    assert_eq!(h.store.outbox_len().unwrap(), 1);
}

#[test]
fn rejected_actor_leaves_no_trace() {
    let h = Harness::new();
    let input = Bump {
        community_id: h.community_id,
        key: "likes".into(),
        times: 1,
        fail_after_write: false,
    };

    let err = h.executor.execute(&h.bump, h.outsider(), input).unwrap_err();

    assert!(matches!(err, OperationError::Authorization(AuthzError::InvalidActor(_))));
    assert_eq!(h.store.count_all().unwrap(), 0);
    assert_eq!(h.store.outbox_len().unwrap(), 0);
}

#[test]
fn invalid_input_is_rejected_before_guards() {
    let h = Harness::new();
    let input = Bump {
        community_id: h.community_id,
        key: String::new(),
        times: 1,
        fail_after_write: false,
    };

    // An outsider with bad input sees the validation error, not the guard.
    let err = h.executor.execute(&h.bump, h.outsider(), input).unwrap_err();
    assert!(matches!(err, OperationError::Validation(_)));
}

#[test]
fn records_from_one_transaction_drain_in_order() {
    let h = Harness::new();
    h.bump("likes", 5).unwrap();
    let recorder = Arc::new(Recorder::default());
    let mut dispatcher = h.dispatcher(DrainConfig::default().with_batch_size(2));
    dispatcher.register_policy(recorder.clone()).unwrap();

    let report = dispatcher.drain("recorder").unwrap();

    assert_eq!(report.applied, 5);
    let seen = recorder.seen();
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    let expected: Vec<OutboxId> = h.store.outbox().unwrap().iter().map(|r| r.id).collect();
    assert_eq!(seen, expected);
}

#[test]
fn failing_consumer_blocks_only_itself() {
    let h = Harness::new();
    h.bump("likes", 2).unwrap();
    let recorder = Arc::new(Recorder::failing(2));
    let mut dispatcher = h.dispatcher(DrainConfig::default());
    dispatcher.register_policy(recorder.clone()).unwrap();
    dispatcher.register_projection(Arc::new(Tally)).unwrap();

    let reports: Vec<_> = dispatcher.drain_all().into_iter().map(Result::unwrap).collect();

    let first = h.store.outbox().unwrap()[0].id;
    assert_eq!(reports[0].consumer, "recorder");
    assert_eq!(reports[0].applied, 0);
    assert_eq!(reports[0].blocked_at, Some(first));
    assert_eq!(reports[1].applied, 2);
    assert_eq!(TALLIES.read(h.store.as_ref(), "likes").unwrap(), Some(Counter { value: 2 }));
    assert_eq!(h.store.processed_outcome("recorder", first).unwrap(), None);

    // Second failure, then the node recovers.
    assert_eq!(dispatcher.drain("recorder").unwrap().failed, 1);
    let report = dispatcher.drain("recorder").unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(recorder.seen().len(), 2);
    assert_eq!(dispatcher.drain("recorder").unwrap().applied, 0);
}

#[test]
fn poisoned_record_is_dead_lettered_after_max_attempts() {
    let h = Harness::new();
    h.bump("poison", 1).unwrap();
    h.bump("likes", 1).unwrap();
    let recorder = Arc::new(Recorder::poisoned("poison"));
    let mut dispatcher = h.dispatcher(DrainConfig::default().with_max_attempts(2));
    dispatcher.register_policy(recorder.clone()).unwrap();
    let outbox = h.store.outbox().unwrap();

    let first = dispatcher.drain("recorder").unwrap();
    assert_eq!(first.blocked_at, Some(outbox[0].id));
    assert!(recorder.seen().is_empty());

    let second = dispatcher.drain("recorder").unwrap();
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(second.applied, 1);
    assert_eq!(second.blocked_at, None);
    assert_eq!(recorder.seen(), vec![outbox[1].id]);

    assert_eq!(
        h.store.processed_outcome("recorder", outbox[0].id).unwrap(),
        Some(ProcessOutcome::DeadLettered)
    );
    let letters = h.store.dead_letters("recorder").unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 2);
    assert!(letters[0].last_error.contains("cannot handle poison"));
}

#[test]
fn unbounded_retry_never_dead_letters() {
    let h = Harness::new();
    h.bump("poison", 1).unwrap();
    let mut dispatcher = h.dispatcher(DrainConfig::default());
    dispatcher.register_policy(Arc::new(Recorder::poisoned("poison"))).unwrap();

    for _ in 0..10 {
        let report = dispatcher.drain("recorder").unwrap();
        assert_eq!(report.dead_lettered, 0);
        assert!(report.blocked_at.is_some());
    }
    assert!(h.store.dead_letters("recorder").unwrap().is_empty());
}

#[test]
fn rebuild_discards_projection_state_and_replays() {
    let h = Harness::new();
    h.bump("likes", 3).unwrap();
    h.bump("shares", 1).unwrap();
    let mut dispatcher = h.dispatcher(DrainConfig::default());
    dispatcher.register_projection(Arc::new(Tally)).unwrap();
    dispatcher.drain("tally").unwrap();

    // Corrupt the read model.
    let mut tx = h.store.begin().unwrap();
    TALLIES.put(&mut *tx, "likes", &Counter { value: 99 }).unwrap();
    TALLIES.put(&mut *tx, "bogus", &Counter { value: 1 }).unwrap();
    tx.commit().unwrap();

    let report = dispatcher.rebuild("tally").unwrap();

    assert_eq!(report.applied, 4);
    assert_eq!(TALLIES.read(h.store.as_ref(), "likes").unwrap(), Some(Counter { value: 3 }));
    assert_eq!(TALLIES.read(h.store.as_ref(), "shares").unwrap(), Some(Counter { value: 1 }));
    assert_eq!(TALLIES.read(h.store.as_ref(), "bogus").unwrap(), None);
}

#[test]
fn rebuild_refuses_plain_policies() {
    let h = Harness::new();
    let mut dispatcher = h.dispatcher(DrainConfig::default());
    dispatcher.register_policy(Arc::new(Recorder::default())).unwrap();

    assert_eq!(
        dispatcher.rebuild("recorder").unwrap_err(),
        DrainError::NotAProjection("recorder".into())
    );
    assert_eq!(
        dispatcher.drain("missing").unwrap_err(),
        DrainError::UnknownConsumer("missing".into())
    );
    assert_eq!(
        dispatcher.register_policy(Arc::new(Recorder::default())).unwrap_err(),
        DrainError::DuplicateConsumer("recorder".into())
    );
}

#[test]
fn concurrent_drains_apply_each_record_once() {
    let h = Harness::new();
    for _ in 0..10 {
        h.bump("likes", 3).unwrap();
    }
    let mut dispatcher = h.dispatcher(DrainConfig::default().with_batch_size(4));
    dispatcher.register_projection(Arc::new(Tally)).unwrap();
    let dispatcher = Arc::new(dispatcher);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || dispatcher.drain("tally").unwrap().applied)
        })
        .collect();
    let applied: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(applied, 30);
    assert_eq!(TALLIES.read(h.store.as_ref(), "likes").unwrap(), Some(Counter { value: 30 }));
}

#[test]
fn commit_publishes_notice_with_outbox_ids() {
    let store = Arc::new(InMemoryDataStore::new());
    let bus = Arc::new(InMemoryEventBus::<CommitNotice>::new());
    let executor = CommandExecutor::new(store.clone(), Arc::new(StoreDirectory::new(store.clone())))
        .with_notices(bus.clone());
    let subscription = bus.subscribe();

    executor
        .execute(
            &bump_command(),
            SystemActor::for_policy("test").into(),
            Bump {
                community_id: CommunityId::new(),
                key: "likes".into(),
                times: 2,
                fail_after_write: false,
            },
        )
        .unwrap();

    let notice = subscription.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(notice.source, "bump");
    assert_eq!(notice.outbox_ids, vec![OutboxId::new(1), OutboxId::new(2)]);
}

#[test]
fn registry_executes_json_payloads_by_name() {
    let h = Harness::new();
    let mut registry = CommandRegistry::new();
    registry.register(Arc::new(bump_command())).unwrap();

    let output = registry
        .execute_json(
            &h.executor,
            "bump",
            h.member(),
            json!({"community_id": h.community_id, "key": "likes", "times": 2}),
        )
        .unwrap();

    assert_eq!(output, json!({"value": 2}));
    assert!(matches!(
        registry.execute_json(&h.executor, "nope", h.member(), json!({})),
        Err(OperationError::UnknownOperation(_))
    ));
    assert!(matches!(
        registry.execute_json(&h.executor, "bump", h.member(), json!({"key": 1})),
        Err(OperationError::Validation(_))
    ));
    assert!(registry.register(Arc::new(bump_command())).is_err());
}

#[test]
fn drain_worker_catches_up_on_notices() {
    let store = Arc::new(InMemoryDataStore::new());
    let bus = Arc::new(InMemoryEventBus::<CommitNotice>::new());
    let executor = CommandExecutor::new(store.clone(), Arc::new(StoreDirectory::new(store.clone())))
        .with_notices(bus.clone());
    let mut dispatcher = Dispatcher::new(
        store.clone(),
        DrainConfig::default().with_poll_interval(Duration::from_millis(20)),
    );
    dispatcher.register_projection(Arc::new(Tally)).unwrap();
    let workers = DrainWorker::spawn_all(Arc::new(dispatcher), Some(bus.as_ref())).unwrap();

    executor
        .execute(
            &bump_command(),
            SystemActor::for_policy("test").into(),
            Bump {
                community_id: CommunityId::new(),
                key: "likes".into(),
                times: 3,
                fail_after_write: false,
            },
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut tally = None;
    while Instant::now() < deadline {
        tally = TALLIES.read(store.as_ref(), "likes").unwrap();
        if tally == Some(Counter { value: 3 }) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    for worker in workers {
        worker.shutdown();
    }
    assert_eq!(tally, Some(Counter { value: 3 }));
}
