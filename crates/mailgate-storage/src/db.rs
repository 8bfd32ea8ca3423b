//! Postgres pool, shared by the queue and the counting store

use mailgate_common::config::DatabaseConfig;
use mailgate_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloneable handle around the single process-wide pool
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("database.url (or DATABASE_URL) required".to_string()))?;

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("connect failed: {}", e)))?;
        info!(
            max_connections = config.max_connections,
            "Connected to Postgres"
        );

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply any pending migrations. Called once at startup, before
    /// anything touches the jobs or counters tables.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {}", e)))?;
        info!("Schema migrations applied");
        Ok(())
    }

    /// Cheap liveness probe
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("health check failed: {}", e)))?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to come back
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
