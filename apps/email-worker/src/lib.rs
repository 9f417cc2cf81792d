//! Email delivery worker.
//!
//! Runs the queue processor loop until a shutdown signal arrives. Several
//! worker instances can run against the same database; row claiming keeps
//! them from delivering the same message twice.

use std::sync::Arc;

use core_config::database::DatabaseConfig;
use core_config::redis::RedisConfig;
use core_config::tracing::init_tracing;
use core_config::{Environment, FromEnv};
use migration::{Migrator, MigratorTrait};
use tracing::{info, warn};

use domain_email::gateway::ProviderGateway;
use domain_email::lane::{EphemeralLane, InMemoryLane, RedisLane};
use domain_email::postgres_repository_impl::{
    PostgresAnalyticsRepository, PostgresEmailLogRepository, PostgresProviderRepository,
    PostgresQueueRepository,
};
use domain_email::{QueueProcessor, QueueProcessorConfig};

pub async fn run() -> eyre::Result<()> {
    let environment = Environment::from_env();
    init_tracing(&environment);

    let db_config = DatabaseConfig::from_env()?;
    let db = sea_orm::Database::connect(&db_config.url)
        .await
        .map_err(|e| eyre::eyre!("PostgreSQL connection failed: {}", e))?;
    Migrator::up(&db, None)
        .await
        .map_err(|e| eyre::eyre!("Migration failed: {}", e))?;
    info!("Database connected, migrations applied");

    let lane: Arc<dyn EphemeralLane> = match RedisConfig::from_env() {
        Ok(config) => {
            let client = redis::Client::open(config.uri.as_str())?;
            let manager = redis::aio::ConnectionManager::new(client).await?;
            info!("Redis connected, using shared ephemeral lane");
            Arc::new(RedisLane::new(manager))
        }
        Err(_) => {
            warn!("REDIS_URL not set, using in-process ephemeral lane");
            Arc::new(InMemoryLane::new())
        }
    };

    let logs = Arc::new(PostgresEmailLogRepository::new(db.clone()));
    let queue = Arc::new(PostgresQueueRepository::new(db.clone()));
    let providers = Arc::new(PostgresProviderRepository::new(db.clone()));
    let analytics = Arc::new(PostgresAnalyticsRepository::new(db.clone()));
    let gateway = Arc::new(ProviderGateway::new(providers));

    let processor = Arc::new(QueueProcessor::new(
        logs,
        queue,
        lane,
        gateway,
        analytics,
        QueueProcessorConfig::default(),
    ));

    processor.start().await;
    info!("Email worker running, waiting for shutdown signal");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutdown signal received, stopping processor");
    processor.stop().await;
    db.close().await.ok();
    info!("Email worker shutdown complete");
    Ok(())
}
