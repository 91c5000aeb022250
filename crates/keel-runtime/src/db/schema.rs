use sqlx::PgPool;

use keel_core::error::{KeelError, Result};

/// DDL for the keel tables, embedded from the migrations directory.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_keel_schema.sql");

/// Create the keel tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| KeelError::Database(format!("Failed to apply schema: {}", e)))?;
    tracing::debug!("Keel schema ensured");
    Ok(())
}
