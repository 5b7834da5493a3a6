//! Postgres access for orders, payments and deliveries
//!
//! Every repository is a trait with a Postgres implementation and an
//! in-memory one; services only ever see `Arc<dyn …Repository>`.

pub mod delivery_repository;
pub mod error;
pub mod in_memory;
pub mod order_repository;
pub mod payment_repository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error as log_error, info, warn};

use self::error::DatabaseError;
use crate::config::DatabaseConfig;

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// Pool sizing derived from [`DatabaseConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            acquire_timeout: Duration::from_secs(config.connection_timeout),
            idle_timeout: Duration::from_secs(
                config.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            ),
        }
    }
}

/// Connect to Postgres using the configured pool limits
pub async fn init_pool_from_config(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    let pool_config = PoolConfig::from(config);
    info!(
        max_connections = pool_config.max_connections,
        min_connections = pool_config.min_connections,
        acquire_timeout = ?pool_config.acquire_timeout,
        "Connecting to Postgres"
    );

    PgPoolOptions::new()
        .max_connections(pool_config.max_connections)
        .min_connections(pool_config.min_connections)
        .acquire_timeout(pool_config.acquire_timeout)
        .idle_timeout(pool_config.idle_timeout)
        .max_lifetime(MAX_LIFETIME)
        .connect(&config.url)
        .await
        .map_err(|e| {
            log_error!(error = %e, "Failed to connect to Postgres");
            DatabaseError::from_sqlx(e)
        })
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        log_error!(error = %e, "Database migration failed");
        DatabaseError::from(e)
    })?;

    info!("Database migrations applied");
    Ok(())
}

/// Round-trip a trivial query
pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1").execute(pool).await.map_err(|e| {
        warn!(error = %e, "Database health check failed");
        DatabaseError::from_sqlx(e)
    })?;

    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
}

pub fn pool_stats(pool: &PgPool) -> PoolStats {
    PoolStats {
        size: pool.size(),
        idle: pool.num_idle() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_follows_database_config() {
        let db = DatabaseConfig {
            url: "postgres://localhost/shop".to_string(),
            max_connections: 8,
            min_connections: 1,
            connection_timeout: 5,
            idle_timeout: None,
        };
        let config = PoolConfig::from(&db);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));

        let db = DatabaseConfig {
            idle_timeout: Some(30),
            ..db
        };
        assert_eq!(PoolConfig::from(&db).idle_timeout, Duration::from_secs(30));
    }
}
