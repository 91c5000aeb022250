use std::sync::Arc;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use keel_core::config::DatabaseConfig;
use keel_core::error::{KeelError, Result};

use super::schema::ensure_schema;

/// Database connection wrapper providing connection pooling.
#[derive(Clone)]
pub struct Database {
    pool: Arc<PgPool>,
    config: DatabaseConfig,
}

impl Database {
    /// Connect using the configuration, applying the schema when enabled.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(KeelError::Config("database.url is not set".into()));
        }

        let pool = Self::create_pool(config)
            .await
            .map_err(|e| KeelError::Database(format!("Failed to connect: {}", e)))?;

        if config.ensure_schema {
            ensure_schema(&pool).await?;
        }

        tracing::info!(pool_size = config.pool_size, "Connected to database");

        Ok(Self {
            pool: Arc::new(pool),
            config: config.clone(),
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            config: DatabaseConfig::default(),
        }
    }

    async fn create_pool(config: &DatabaseConfig) -> sqlx::Result<PgPool> {
        let statement_timeout_ms = config.statement_timeout().as_millis().to_string();
        let options: PgConnectOptions = config
            .url
            .parse::<PgConnectOptions>()?
            .options([("statement_timeout", statement_timeout_ms.as_str())]);

        PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.pool_timeout())
            .connect_with(options)
            .await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool.as_ref())
            .await
            .map_err(|e| KeelError::Database(format!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Close all connections gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Type alias for the pool type.
pub type DatabasePool = PgPool;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_url_rejected() {
        let config = DatabaseConfig::default();
        let err = Database::from_config(&config).await.err().unwrap();
        assert!(matches!(err, KeelError::Config(_)));
    }
}
