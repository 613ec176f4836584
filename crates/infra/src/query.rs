//! Read-only operations.
//!
//! Queries never open a transaction and never touch the outbox. A descriptor
//! with no guards is a public read and may run without an actor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

use civitas_auth::{Actor, AuthContext, AuthzError, Directory, Guard, GuardChain};
use civitas_core::Validate;

use crate::datastore::{DataStore, StoreResult, Table};
use crate::error::OperationError;

type QueryBody<I, O> = Box<dyn Fn(&QueryContext<'_>, I) -> Result<O, OperationError> + Send + Sync>;

pub struct QueryDescriptor<I, O> {
    name: &'static str,
    guards: GuardChain<I>,
    body: QueryBody<I, O>,
}

impl<I, O> QueryDescriptor<I, O> {
    pub fn new(
        name: &'static str,
        body: impl Fn(&QueryContext<'_>, I) -> Result<O, OperationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            guards: GuardChain::new(),
            body: Box::new(body),
        }
    }

    pub fn guard(mut self, guard: impl Guard<I> + 'static) -> Self {
        self.guards = self.guards.with(guard);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_public(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Read-only view handed to a query body.
pub struct QueryContext<'a> {
    store: &'a dyn DataStore,
    auth: Option<&'a AuthContext>,
    now: DateTime<Utc>,
}

impl QueryContext<'_> {
    pub fn get<T: Serialize + DeserializeOwned>(&self, table: &Table<T>, key: &str) -> StoreResult<Option<T>> {
        table.read(self.store, key)
    }

    pub fn scan<T: Serialize + DeserializeOwned>(&self, table: &Table<T>, prefix: &str) -> StoreResult<Vec<(String, T)>> {
        table.read_scan(self.store, prefix)
    }

    /// `None` for anonymous calls to public queries.
    pub fn auth(&self) -> Option<&AuthContext> {
        self.auth
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

pub struct QueryExecutor {
    store: Arc<dyn DataStore>,
    directory: Arc<dyn Directory>,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn DataStore>, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    pub fn execute<I, O>(&self, descriptor: &QueryDescriptor<I, O>, actor: Option<Actor>, input: I) -> Result<O, OperationError>
    where
        I: Validate,
        O: Validate,
    {
        self.execute_at(descriptor, actor, input, Utc::now())
    }

    #[instrument(skip_all, fields(query = descriptor.name()), err)]
    pub fn execute_at<I, O>(
        &self,
        descriptor: &QueryDescriptor<I, O>,
        actor: Option<Actor>,
        input: I,
        now: DateTime<Utc>,
    ) -> Result<O, OperationError>
    where
        I: Validate,
        O: Validate,
    {
        input.validate()?;

        let auth = match actor {
            Some(actor) => Some(
                descriptor
                    .guards
                    .authorize(actor, &input, now, self.directory.as_ref())?,
            ),
            None if descriptor.is_public() => None,
            None => return Err(AuthzError::Unauthenticated.into()),
        };

        let ctx = QueryContext {
            store: self.store.as_ref(),
            auth: auth.as_ref(),
            now,
        };
        let output = (descriptor.body)(&ctx, input)?;
        output.validate()?;
        Ok(output)
    }
}
