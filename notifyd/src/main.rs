use notifyd::config::AppConfig;
use notifyd::database;
use notifyd::logging::init_logging;
use notifyd::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env_or_default();

    // Initialize logging; the guard flushes the file writer on exit
    let (logging_config, _log_guard) = init_logging(&config.log_dir)?;

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::new(pool, config)?;
    container.seed().await?;
    container.start();
    logging_config.start_retention_cleanup(container.cancellation_token());

    tracing::info!("notifyd started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    container.shutdown().await;
    container.pool.close().await;
    Ok(())
}
