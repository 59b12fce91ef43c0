//! PostgreSQL repository implementation using sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{GradingConfig, StoredResult, Submission, SubmissionStatus};

use super::migrations::MigrationRunner;
use super::Repository;

/// Repository backed by a PostgreSQL connection pool.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connects to the database.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await
    }
}

fn status_str(status: SubmissionStatus) -> &'static str {
    match status {
        SubmissionStatus::Pending => "pending",
        SubmissionStatus::Running => "running",
        SubmissionStatus::Completed => "completed",
        SubmissionStatus::Failed => "failed",
        SubmissionStatus::Cancelled => "cancelled",
    }
}

fn parse_status(raw: &str) -> Result<SubmissionStatus, StorageError> {
    match raw {
        "pending" => Ok(SubmissionStatus::Pending),
        "running" => Ok(SubmissionStatus::Running),
        "completed" => Ok(SubmissionStatus::Completed),
        "failed" => Ok(SubmissionStatus::Failed),
        "cancelled" => Ok(SubmissionStatus::Cancelled),
        other => Err(StorageError::Migration(format!(
            "unknown submission status '{other}' in database"
        ))),
    }
}

fn config_from_row(row: &sqlx::postgres::PgRow) -> Result<GradingConfig, StorageError> {
    Ok(GradingConfig {
        id: row.try_get("id")?,
        assignment_id: row.try_get("assignment_id")?,
        template_name: row.try_get("template_name")?,
        languages: serde_json::from_value(row.try_get::<serde_json::Value, _>("languages")?)?,
        criteria: serde_json::from_value(row.try_get::<serde_json::Value, _>("criteria")?)?,
        setup: row
            .try_get::<Option<serde_json::Value>, _>("setup")?
            .map(serde_json::from_value)
            .transpose()?,
        feedback: serde_json::from_value(row.try_get::<serde_json::Value, _>("feedback")?)?,
        version: row.try_get("version")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn submission_from_row(row: &sqlx::postgres::PgRow) -> Result<Submission, StorageError> {
    let status: String = row.try_get("status")?;
    Ok(Submission {
        id: row.try_get("id")?,
        assignment_id: row.try_get("assignment_id")?,
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        language: row.try_get("language")?,
        files: serde_json::from_value(row.try_get::<serde_json::Value, _>("files")?)?,
        status: parse_status(&status)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn create_config(&self, config: GradingConfig) -> Result<GradingConfig, StorageError> {
        if config.is_active {
            let existing: Option<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM grading_configs WHERE assignment_id = $1 AND is_active",
            )
            .bind(&config.assignment_id)
            .fetch_optional(&self.pool)
            .await?;

            if existing.is_some() {
                return Err(StorageError::Conflict(format!(
                    "assignment '{}' already has an active config",
                    config.assignment_id
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO grading_configs (
                id, assignment_id, template_name, languages, criteria, setup,
                feedback, version, is_active, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(config.id)
        .bind(&config.assignment_id)
        .bind(&config.template_name)
        .bind(serde_json::to_value(&config.languages)?)
        .bind(serde_json::to_value(&config.criteria)?)
        .bind(config.setup.as_ref().map(serde_json::to_value).transpose()?)
        .bind(serde_json::to_value(&config.feedback)?)
        .bind(config.version)
        .bind(config.is_active)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(config)
    }

    async fn get_active_config(
        &self,
        assignment_id: &str,
    ) -> Result<Option<GradingConfig>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, assignment_id, template_name, languages, criteria, setup,
                   feedback, version, is_active, created_at, updated_at
            FROM grading_configs
            WHERE assignment_id = $1 AND is_active
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(config_from_row).transpose()
    }

    async fn get_config(&self, id: Uuid) -> Result<Option<GradingConfig>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, assignment_id, template_name, languages, criteria, setup,
                   feedback, version, is_active, created_at, updated_at
            FROM grading_configs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(config_from_row).transpose()
    }

    async fn create_submission(&self, submission: &Submission) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO submissions (
                id, assignment_id, user_id, username, language, files, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(submission.id)
        .bind(&submission.assignment_id)
        .bind(&submission.user_id)
        .bind(&submission.username)
        .bind(&submission.language)
        .bind(serde_json::to_value(&submission.files)?)
        .bind(status_str(submission.status))
        .bind(submission.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, assignment_id, user_id, username, language, files, status, created_at
            FROM submissions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(submission_from_row).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: SubmissionStatus,
    ) -> Result<(), StorageError> {
        let updated = sqlx::query("UPDATE submissions SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status_str(status))
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("submission {id}")));
        }
        Ok(())
    }

    async fn save_result(
        &self,
        result: &StoredResult,
        status: SubmissionStatus,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO submission_results (
                submission_id, result_tree, focus, feedback, feedback_degraded,
                pipeline_execution, final_score, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (submission_id) DO UPDATE SET
                result_tree = EXCLUDED.result_tree,
                focus = EXCLUDED.focus,
                feedback = EXCLUDED.feedback,
                feedback_degraded = EXCLUDED.feedback_degraded,
                pipeline_execution = EXCLUDED.pipeline_execution,
                final_score = EXCLUDED.final_score,
                updated_at = NOW()
            "#,
        )
        .bind(result.submission_id)
        .bind(result.result_tree.as_ref().map(serde_json::to_value).transpose()?)
        .bind(result.focus.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&result.feedback)
        .bind(result.feedback_degraded)
        .bind(serde_json::to_value(&result.execution)?)
        .bind(result.final_score)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE submissions SET status = $2 WHERE id = $1")
            .bind(result.submission_id)
            .bind(status_str(status))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_result(&self, submission_id: Uuid) -> Result<Option<StoredResult>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT submission_id, result_tree, focus, feedback, feedback_degraded,
                   pipeline_execution, final_score, updated_at
            FROM submission_results
            WHERE submission_id = $1
            "#,
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(StoredResult {
            submission_id: row.try_get("submission_id")?,
            result_tree: row
                .try_get::<Option<serde_json::Value>, _>("result_tree")?
                .map(serde_json::from_value)
                .transpose()?,
            focus: row
                .try_get::<Option<serde_json::Value>, _>("focus")?
                .map(serde_json::from_value)
                .transpose()?,
            feedback: row.try_get("feedback")?,
            feedback_degraded: row.try_get("feedback_degraded")?,
            execution: serde_json::from_value(
                row.try_get::<serde_json::Value, _>("pipeline_execution")?,
            )?,
            final_score: row.try_get("final_score")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        }))
    }
}
