//! Outbox drain worker.
//!
//! Runs every community policy and projection against the configured
//! datastore until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use civitas_community::CommunityApp;
use civitas_events::{CommitNotice, InMemoryEventBus};
use civitas_infra::{
    DataStore, DrainWorker, InMemoryDataStore, InfraConfig, LoggingNotificationProvider, PostgresDataStore,
};

fn main() -> anyhow::Result<()> {
    let log_format = civitas_observability::init();
    let config = InfraConfig::from_env().context("invalid configuration")?;
    info!(?log_format, drain = ?config.drain, "starting civitas-worker");

    let store: Arc<dyn DataStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresDataStore::connect(url, config.pg_max_connections)
                .context("failed to connect to Postgres")?;
            store.ensure_schema().context("failed to prepare schema")?;
            info!(max_connections = config.pg_max_connections, "using Postgres datastore");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory datastore");
            Arc::new(InMemoryDataStore::new())
        }
    };

    // Notices only reach workers in this process; other writers are picked up by polling.
    let bus = Arc::new(InMemoryEventBus::<CommitNotice>::new());
    let app = CommunityApp::new(
        store,
        Arc::new(LoggingNotificationProvider),
        config.drain.clone(),
        Some(bus.clone()),
    )
    .context("failed to wire community app")?;

    let workers = DrainWorker::spawn_all(app.dispatcher.clone(), Some(bus.as_ref()))
        .context("failed to spawn drain workers")?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")?;

    info!(workers = workers.len(), "shutting down");
    for worker in workers {
        worker.shutdown();
    }
    Ok(())
}
