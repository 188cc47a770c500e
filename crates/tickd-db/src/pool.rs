use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use tickd_core::config::DatabaseConfig;
use tickd_core::retry::RetryPolicy;

use crate::error::{DbError, Result};

/// Shared handle on the connection pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect with the bounded retry discipline: 3 attempts, linear
    /// back-off, hard connect timeout from the config (default 10s).
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        let url = cfg.url();
        let pool_size = cfg.pool_size;
        let timeout = Duration::from_secs(cfg.connect_timeout_secs);

        let pool = RetryPolicy::db_connect()
            .run(
                |_e: &sqlx::Error| true,
                || {
                    PgPoolOptions::new()
                        .max_connections(pool_size)
                        .acquire_timeout(timeout)
                        .connect(&url)
                },
            )
            .await
            .map_err(|e| DbError::Connect(e.to_string()))?;

        info!(
            host = %cfg.host,
            port = cfg.port,
            database = %cfg.name,
            pool_size,
            "database pool ready"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, tooling).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
