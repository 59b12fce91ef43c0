//! Persistence: the repository contract and its implementations.
//!
//! The core treats storage as a seam: [`Repository`] covers grading
//! configs, submissions, and results. [`PostgresRepository`] is the
//! production implementation; [`MemoryRepository`] backs tests and the
//! one-shot CLI.

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod schema;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{GradingConfig, StoredResult, Submission, SubmissionStatus};

/// Storage operations the core depends on.
///
/// Writes are transactional at single-submission granularity: a result and
/// its status flip land together or not at all.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Persists a new grading config.
    ///
    /// # Errors
    ///
    /// `StorageError::Conflict` when the assignment already has an active
    /// config.
    async fn create_config(&self, config: GradingConfig) -> Result<GradingConfig, StorageError>;

    /// The active config for an assignment, if any.
    async fn get_active_config(
        &self,
        assignment_id: &str,
    ) -> Result<Option<GradingConfig>, StorageError>;

    async fn get_config(&self, id: Uuid) -> Result<Option<GradingConfig>, StorageError>;

    async fn create_submission(&self, submission: &Submission) -> Result<(), StorageError>;

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, StorageError>;

    async fn update_status(
        &self,
        id: Uuid,
        status: SubmissionStatus,
    ) -> Result<(), StorageError>;

    /// Persists the result payload and flips the submission status in one
    /// transaction.
    async fn save_result(
        &self,
        result: &StoredResult,
        status: SubmissionStatus,
    ) -> Result<(), StorageError>;

    async fn get_result(&self, submission_id: Uuid) -> Result<Option<StoredResult>, StorageError>;
}

pub use memory::MemoryRepository;
pub use postgres::PostgresRepository;
