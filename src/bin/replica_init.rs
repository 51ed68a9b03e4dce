use anyhow::Context;
use replica_store::{
    config::Config,
    infrastructure::database::{MongoReplicaAdmin, ReplicaTopologyInitializer},
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the replica set once at cluster bring-up. Safe to re-run.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::init().context("Invalid configuration")?;
    let admin = Arc::new(MongoReplicaAdmin::new(config.connection.connect_timeout));

    let members = config.replica_init.members();
    let initializer =
        ReplicaTopologyInitializer::new(Arc::clone(&admin) as _, config.replica_init.clone());

    let outcome = initializer.ensure_initialized(&members).await;
    admin.close().await;
    let outcome = outcome.context("Replica set initialization failed")?;

    info!(?outcome, "🏁 Replica set bootstrap finished");
    Ok(())
}
