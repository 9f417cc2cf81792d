//! Email relay HTTP API.
//!
//! Exposes the intake, queue control, and webhook endpoints under `/email`.
//! The delivery loop itself runs in the separate worker binary; this service
//! only accepts work and answers status queries.

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use core_config::database::DatabaseConfig;
use core_config::redis::RedisConfig;
use core_config::server::ServerConfig;
use core_config::tracing::init_tracing;
use core_config::{Environment, FromEnv};
use migration::{Migrator, MigratorTrait};
use tracing::{info, warn};

use domain_email::gateway::ProviderGateway;
use domain_email::lane::{EphemeralLane, InMemoryLane, RedisLane};
use domain_email::postgres_repository_impl::{
    PostgresAnalyticsRepository, PostgresEmailLogRepository, PostgresProviderRepository,
    PostgresQueueRepository, PostgresUnsubscribeRepository,
};
use domain_email::service::EmailServiceConfig;
use domain_email::templates::TemplateRenderer;
use domain_email::{EmailService, StatusTracker};

pub async fn run() -> eyre::Result<()> {
    let environment = Environment::from_env();
    init_tracing(&environment);

    let db_config = DatabaseConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;

    let db = sea_orm::Database::connect(&db_config.url)
        .await
        .map_err(|e| eyre::eyre!("PostgreSQL connection failed: {}", e))?;
    Migrator::up(&db, None)
        .await
        .map_err(|e| eyre::eyre!("Migration failed: {}", e))?;
    info!("Database connected, migrations applied");

    let lane = build_lane().await?;

    let logs = Arc::new(PostgresEmailLogRepository::new(db.clone()));
    let queue = Arc::new(PostgresQueueRepository::new(db.clone()));
    let providers = Arc::new(PostgresProviderRepository::new(db.clone()));
    let analytics = Arc::new(PostgresAnalyticsRepository::new(db.clone()));
    let unsubscribes = Arc::new(PostgresUnsubscribeRepository::new(db.clone()));

    let gateway = Arc::new(ProviderGateway::new(providers));
    let renderer = Arc::new(
        TemplateRenderer::new().map_err(|e| eyre::eyre!("Template setup failed: {}", e))?,
    );

    let service = Arc::new(EmailService::new(
        logs.clone(),
        queue,
        lane,
        unsubscribes.clone(),
        analytics.clone(),
        gateway.clone(),
        renderer,
        EmailServiceConfig::default(),
    ));
    let tracker = Arc::new(StatusTracker::new(logs, unsubscribes, analytics, gateway));

    let app = Router::new()
        .route("/health", get(health))
        .nest("/email", domain_email::handlers::router(service, tracker));

    let listener = tokio::net::TcpListener::bind(server_config.address()).await?;
    info!(address = %server_config.address(), "Email relay API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down: closing database connection");
    db.close().await.ok();
    Ok(())
}

/// Redis backs the ephemeral lane when configured; otherwise the lane is
/// process-local, which is fine for single-instance deployments.
async fn build_lane() -> eyre::Result<Arc<dyn EphemeralLane>> {
    match RedisConfig::from_env() {
        Ok(config) => {
            let client = redis::Client::open(config.uri.as_str())?;
            let manager = redis::aio::ConnectionManager::new(client).await?;
            info!("Redis connected, using shared ephemeral lane");
            Ok(Arc::new(RedisLane::new(manager)))
        }
        Err(_) => {
            warn!("REDIS_URL not set, using in-process ephemeral lane");
            Ok(Arc::new(InMemoryLane::new()))
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Shutdown signal received");
    }
}
