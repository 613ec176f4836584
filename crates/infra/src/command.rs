//! Command execution pipeline.
//!
//! ```text
//! input
//!   ↓
//! 1. Validate input (before any guard)
//!   ↓
//! 2. Guard chain (AND, short-circuit; may persist a tier upgrade)
//!   ↓
//! 3. Begin transaction
//!   ↓
//! 4. Body: mutate state and emit events through the same transaction
//!   ↓
//! 5. Validate output
//!   ↓
//! 6. Commit (state + outbox together), then publish a commit notice
//! ```
//!
//! Any error in steps 4-6 rolls back every mutation and every outbox record
//! appended during the call. The executor never retries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use civitas_auth::{Actor, AuthContext, Directory, Guard, GuardChain};
use civitas_core::Validate;
use civitas_events::{BusError, CommitNotice, Event, EventBus, EventEnvelope, OutboxId};

use crate::datastore::{DataStore, Transaction};
use crate::error::OperationError;

type CommandBody<I, O> =
    Box<dyn Fn(&mut CommandContext<'_>, I) -> Result<O, OperationError> + Send + Sync>;

/// Immutable description of a command, built once at startup.
pub struct CommandDescriptor<I, O> {
    name: &'static str,
    guards: GuardChain<I>,
    body: CommandBody<I, O>,
}

impl<I, O> CommandDescriptor<I, O> {
    pub fn new(
        name: &'static str,
        body: impl Fn(&mut CommandContext<'_>, I) -> Result<O, OperationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            guards: GuardChain::new(),
            body: Box::new(body),
        }
    }

    /// Append a guard; guards run in the order they are added.
    pub fn guard(mut self, guard: impl Guard<I> + 'static) -> Self {
        self.guards = self.guards.with(guard);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn guards(&self) -> &GuardChain<I> {
        &self.guards
    }
}

impl<I, O> core::fmt::Debug for CommandDescriptor<I, O> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("guards", &self.guards)
            .finish()
    }
}

/// What a command body gets to work with.
pub struct CommandContext<'a> {
    tx: &'a mut dyn Transaction,
    auth: &'a AuthContext,
    now: DateTime<Utc>,
}

impl<'a> CommandContext<'a> {
    fn new(tx: &'a mut dyn Transaction, auth: &'a AuthContext, now: DateTime<Utc>) -> Self {
        Self { tx, auth, now }
    }

    pub fn tx(&mut self) -> &mut dyn Transaction {
        &mut *self.tx
    }

    pub fn auth(&self) -> &AuthContext {
        self.auth
    }

    pub fn actor(&self) -> &Actor {
        &self.auth.actor
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Append an event to the outbox through this command's transaction.
    pub fn emit<E: Event>(&mut self, event: &E) -> Result<(), OperationError> {
        let envelope = EventEnvelope::from_event(event, self.now)
            .map_err(|e| OperationError::Validation(format!("{}: {e}", E::NAME)))?;
        self.tx.append(envelope)?;
        Ok(())
    }
}

/// Runs command descriptors against an explicit datastore handle.
pub struct CommandExecutor {
    store: Arc<dyn DataStore>,
    directory: Arc<dyn Directory>,
    notices: Option<Arc<dyn EventBus<CommitNotice, Error = BusError>>>,
}

impl CommandExecutor {
    pub fn new(store: Arc<dyn DataStore>, directory: Arc<dyn Directory>) -> Self {
        Self {
            store,
            directory,
            notices: None,
        }
    }

    /// Publish a [`CommitNotice`] after every commit that appended events.
    pub fn with_notices(mut self, bus: Arc<dyn EventBus<CommitNotice, Error = BusError>>) -> Self {
        self.notices = Some(bus);
        self
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn execute<I, O>(&self, descriptor: &CommandDescriptor<I, O>, actor: Actor, input: I) -> Result<O, OperationError>
    where
        I: Validate,
        O: Validate,
    {
        self.execute_at(descriptor, actor, input, Utc::now())
    }

    /// Same as [`CommandExecutor::execute`] with an explicit clock reading.
    #[instrument(skip_all, fields(command = descriptor.name(), actor = %actor.label()), err)]
    pub fn execute_at<I, O>(
        &self,
        descriptor: &CommandDescriptor<I, O>,
        actor: Actor,
        input: I,
        now: DateTime<Utc>,
    ) -> Result<O, OperationError>
    where
        I: Validate,
        O: Validate,
    {
        input.validate()?;
        let auth = descriptor
            .guards
            .authorize(actor, &input, now, self.directory.as_ref())?;

        let mut tx = self.store.begin()?;
        let result = {
            let mut ctx = CommandContext::new(&mut *tx, &auth, now);
            (descriptor.body)(&mut ctx, input)
        }
        .and_then(|output| {
            output.validate()?;
            Ok(output)
        });

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(command = descriptor.name, error = %rollback_err, "rollback failed");
                }
                return Err(err);
            }
        };

        let outbox_ids = tx.commit()?;
        debug!(command = descriptor.name, events = outbox_ids.len(), "command committed");

        if !outbox_ids.is_empty() {
            self.publish_notice(descriptor.name, outbox_ids);
        }
        Ok(output)
    }

    /// Run a command inside a transaction owned by the caller.
    ///
    /// Used by policies: the command's writes and events commit together
    /// with the policy's processed mark, or roll back with it. Nothing is
    /// committed or published here.
    #[instrument(skip_all, fields(command = descriptor.name(), actor = %actor.label()), err)]
    pub fn execute_within<I, O>(
        &self,
        tx: &mut dyn Transaction,
        descriptor: &CommandDescriptor<I, O>,
        actor: Actor,
        input: I,
        now: DateTime<Utc>,
    ) -> Result<O, OperationError>
    where
        I: Validate,
        O: Validate,
    {
        input.validate()?;
        let auth = descriptor
            .guards
            .authorize(actor, &input, now, self.directory.as_ref())?;

        let mut ctx = CommandContext::new(tx, &auth, now);
        let output = (descriptor.body)(&mut ctx, input)?;
        output.validate()?;
        Ok(output)
    }

    fn publish_notice(&self, source: &'static str, outbox_ids: Vec<OutboxId>) {
        let Some(bus) = &self.notices else {
            return;
        };
        // Best-effort: drains also poll, so a lost notice only delays them.
        if let Err(err) = bus.publish(CommitNotice { source, outbox_ids }) {
            warn!(command = source, error = ?err, "failed to publish commit notice");
        }
    }
}

trait ErasedCommand: Send + Sync {
    fn execute_json(
        &self,
        executor: &CommandExecutor,
        actor: Actor,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<JsonValue, OperationError>;
}

impl<I, O> ErasedCommand for CommandDescriptor<I, O>
where
    I: DeserializeOwned + Validate + 'static,
    O: Serialize + Validate + 'static,
{
    fn execute_json(
        &self,
        executor: &CommandExecutor,
        actor: Actor,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<JsonValue, OperationError> {
        let input: I = serde_json::from_value(payload)?;
        let output = executor.execute_at(self, actor, input, now)?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Name → descriptor lookup for callers that only have a JSON payload.
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Arc<dyn ErasedCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, O>(&mut self, descriptor: Arc<CommandDescriptor<I, O>>) -> Result<(), OperationError>
    where
        I: DeserializeOwned + Validate + 'static,
        O: Serialize + Validate + 'static,
    {
        let name = descriptor.name();
        if self.commands.contains_key(name) {
            return Err(OperationError::invalid_state(format!("command {name} registered twice")));
        }
        self.commands.insert(name, descriptor);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.keys().copied()
    }

    pub fn execute_json(
        &self,
        executor: &CommandExecutor,
        name: &str,
        actor: Actor,
        payload: JsonValue,
    ) -> Result<JsonValue, OperationError> {
        let command = self
            .commands
            .get(name)
            .ok_or_else(|| OperationError::UnknownOperation(name.to_string()))?;
        command.execute_json(executor, actor, payload, Utc::now())
    }
}
