//! In-memory repository for tests and one-shot grading runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{GradingConfig, StoredResult, Submission, SubmissionStatus};

use super::Repository;

/// A repository backed by plain maps behind async locks.
#[derive(Default)]
pub struct MemoryRepository {
    configs: RwLock<Vec<GradingConfig>>,
    submissions: RwLock<HashMap<Uuid, Submission>>,
    results: RwLock<HashMap<Uuid, StoredResult>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_config(&self, config: GradingConfig) -> Result<GradingConfig, StorageError> {
        let mut configs = self.configs.write().await;
        if configs
            .iter()
            .any(|c| c.assignment_id == config.assignment_id && c.is_active)
        {
            return Err(StorageError::Conflict(format!(
                "assignment '{}' already has an active config",
                config.assignment_id
            )));
        }
        configs.push(config.clone());
        Ok(config)
    }

    async fn get_active_config(
        &self,
        assignment_id: &str,
    ) -> Result<Option<GradingConfig>, StorageError> {
        let configs = self.configs.read().await;
        Ok(configs
            .iter()
            .find(|c| c.assignment_id == assignment_id && c.is_active)
            .cloned())
    }

    async fn get_config(&self, id: Uuid) -> Result<Option<GradingConfig>, StorageError> {
        let configs = self.configs.read().await;
        Ok(configs.iter().find(|c| c.id == id).cloned())
    }

    async fn create_submission(&self, submission: &Submission) -> Result<(), StorageError> {
        self.submissions
            .write()
            .await
            .insert(submission.id, submission.clone());
        Ok(())
    }

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, StorageError> {
        Ok(self.submissions.read().await.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: SubmissionStatus,
    ) -> Result<(), StorageError> {
        let mut submissions = self.submissions.write().await;
        let submission = submissions
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("submission {id}")))?;
        submission.status = status;
        Ok(())
    }

    async fn save_result(
        &self,
        result: &StoredResult,
        status: SubmissionStatus,
    ) -> Result<(), StorageError> {
        // Both maps are updated under the submissions write lock to mirror
        // the transactional contract of the Postgres implementation.
        let mut submissions = self.submissions.write().await;
        let submission = submissions
            .get_mut(&result.submission_id)
            .ok_or_else(|| StorageError::NotFound(format!("submission {}", result.submission_id)))?;
        submission.status = status;

        let mut stored = result.clone();
        stored.updated_at = Utc::now();
        self.results
            .write()
            .await
            .insert(result.submission_id, stored);
        Ok(())
    }

    async fn get_result(&self, submission_id: Uuid) -> Result<Option<StoredResult>, StorageError> {
        Ok(self.results.read().await.get(&submission_id).cloned())
    }
}
