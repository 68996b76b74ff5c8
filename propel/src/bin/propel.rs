use propel::{
    cache::RedisSharedCache,
    config::EngineConfig,
    error::EngineError,
    logging::init_logging,
    persistence::postgres::PostgresRepository,
    system::System,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = EngineConfig::from_env()?;
    info!(symbols = ?config.symbols, "starting propel engine");

    let repository = PostgresRepository::connect(&config.database_url).await?;
    let cache = RedisSharedCache::connect(&config.redis_url).await?;

    let system = System::start(config, Arc::new(repository), Arc::new(cache)).await?;
    system.run_until_signal().await;

    Ok(())
}
