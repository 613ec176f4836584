//! Infrastructure layer: datastore and outbox, operation executors, the
//! policy runtime and its background workers.

pub mod accounts;
pub mod command;
pub mod config;
pub mod datastore;
pub mod drain;
pub mod error;
pub mod idempotency;
pub mod notify;
pub mod policy;
pub mod query;
pub mod workers;

pub use accounts::{ActorResolver, MembershipRecord, StoreDirectory, UserRecord};
pub use command::{CommandContext, CommandDescriptor, CommandExecutor, CommandRegistry};
pub use config::{ConfigError, DrainConfig, InfraConfig};
pub use datastore::{
    DataStore, FailureRecord, InMemoryDataStore, OutboxStore, PostgresDataStore, StoreError, StoreResult, Table,
    Transaction,
};
pub use drain::{DrainReport, Dispatcher};
pub use error::{DrainError, OperationError, PolicyError};
pub use idempotency::{Effect, credit_delta, insert_once, transition};
pub use notify::{
    LoggingNotificationProvider, NotificationProvider, NotifyError, RecipientStatus, RecordingNotificationProvider,
};
pub use policy::{Policy, PolicyContext, Projection};
pub use query::{QueryContext, QueryDescriptor, QueryExecutor};
pub use workers::{DrainWorker, WorkerHandle};

#[cfg(test)]
mod integration_tests;
