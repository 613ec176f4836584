//! Wiring of the community domain onto the infrastructure layer.

use std::sync::Arc;

use thiserror::Error;

use civitas_auth::{Directory, ResourceOwner};
use civitas_events::{BusError, CommitNotice, EventBus};
use civitas_infra::notify::NotificationProvider;
use civitas_infra::{
    ActorResolver, CommandExecutor, CommandRegistry, DataStore, Dispatcher, DrainConfig, DrainError, OperationError,
    QueryExecutor, StoreDirectory,
};

use crate::commands::CommunityCommands;
use crate::model::{THREADS, ThreadRecord};
use crate::policies::{NotifyThreadCreated, ReferralXpPolicy, ThreadXpPolicy};
use crate::projections::CommunityStatsProjection;
use crate::queries::CommunityQueries;

#[derive(Debug, Error)]
pub enum WiringError {
    #[error(transparent)]
    Command(#[from] OperationError),

    #[error(transparent)]
    Drain(#[from] DrainError),
}

pub type Notices = Arc<dyn EventBus<CommitNotice, Error = BusError>>;

/// Everything a process needs to serve the community domain.
pub struct CommunityApp {
    pub store: Arc<dyn DataStore>,
    pub directory: Arc<dyn Directory>,
    pub resolver: ActorResolver,
    pub executor: Arc<CommandExecutor>,
    pub queries: QueryExecutor,
    pub commands: CommunityCommands,
    pub query_catalog: CommunityQueries,
    pub registry: CommandRegistry,
    pub dispatcher: Arc<Dispatcher>,
}

impl CommunityApp {
    pub fn new(
        store: Arc<dyn DataStore>,
        notifier: Arc<dyn NotificationProvider>,
        config: DrainConfig,
        notices: Option<Notices>,
    ) -> Result<Self, WiringError> {
        let directory: Arc<dyn Directory> = Arc::new(StoreDirectory::new(store.clone()).with_owner(
            "thread",
            THREADS,
            |thread: &ThreadRecord| ResourceOwner::new(thread.author_id).in_community(thread.community_id),
        ));

        let mut executor = CommandExecutor::new(store.clone(), directory.clone());
        let mut dispatcher = Dispatcher::new(store.clone(), config);
        if let Some(bus) = notices {
            executor = executor.with_notices(bus.clone());
            dispatcher = dispatcher.with_notices(bus);
        }
        let executor = Arc::new(executor);

        let commands = CommunityCommands::new();
        let mut registry = CommandRegistry::new();
        registry.register(commands.register_user.clone())?;
        registry.register(commands.create_community.clone())?;
        registry.register(commands.join_community.clone())?;
        registry.register(commands.create_thread.clone())?;
        registry.register(commands.delete_thread.clone())?;
        registry.register(commands.award_xp.clone())?;
        registry.register(commands.ban_user.clone())?;

        dispatcher.register_policy(Arc::new(ThreadXpPolicy::new(executor.clone(), commands.award_xp.clone())))?;
        dispatcher.register_policy(Arc::new(ReferralXpPolicy))?;
        dispatcher.register_policy(Arc::new(NotifyThreadCreated::new(notifier)))?;
        dispatcher.register_projection(Arc::new(CommunityStatsProjection))?;

        Ok(Self {
            resolver: ActorResolver::new(store.clone()),
            queries: QueryExecutor::new(store.clone(), directory.clone()),
            store,
            directory,
            executor,
            commands,
            query_catalog: CommunityQueries::new(),
            registry,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Drain until every consumer is idle, including events emitted by
    /// policies along the way.
    pub fn settle(&self) -> Result<usize, DrainError> {
        self.dispatcher.settle(16)
    }
}
