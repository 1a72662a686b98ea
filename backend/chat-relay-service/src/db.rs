use crate::error::{AppError, AppResult};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/001_create_chat_tables.sql");
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the pool, checks one connection and applies the schema
pub async fn init_pool(database_url: &str, max_connections: usize) -> AppResult<Pool> {
    let pg_config: PgConfig = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| AppError::Config(format!("DATABASE_URL: {e}")))?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(max_connections)
        .build()
        .map_err(|e| AppError::Database(format!("build pool: {e}")))?;

    match tokio::time::timeout(CONNECT_TIMEOUT, run_migrations(&pool)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(AppError::Database(format!(
                "database not reachable within {CONNECT_TIMEOUT:?}"
            )))
        }
    }

    info!(max_connections, "database pool ready");
    Ok(pool)
}

async fn run_migrations(pool: &Pool) -> AppResult<()> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    Ok(())
}
