//! Idempotent migration runner for the Postgres repository.

use sqlx::PgPool;

use crate::error::StorageError;

use super::schema;

/// Applies embedded schema statements, tracking what already ran.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations. Safe to call repeatedly.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        self.ensure_migrations_table().await?;

        for (index, statement) in schema::all_schema_statements().iter().enumerate() {
            let name = format!("schema_v1_part_{index}");
            if !self.is_applied(&name).await? {
                self.apply(&name, statement).await?;
                tracing::info!(migration = %name, "Applied migration");
            }
        }

        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_applied(&self, name: &str) -> Result<bool, StorageError> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn apply(&self, name: &str, sql: &str) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Migration(format!("{name}: {e}")))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
