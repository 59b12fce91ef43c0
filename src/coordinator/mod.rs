//! Submission coordinator: intake, bounded background grading, result
//! surfacing.
//!
//! `submit` validates the request, persists a pending record, and dispatches
//! one pipeline task to the bounded executor; the submission id returns
//! immediately for polling. Capacity never rejects a submission
//! synchronously — backpressure happens inside the pipeline at sandbox
//! acquisition.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::feedback::{failure_feedback, FeedbackProducer};
use crate::models::{
    PipelineExecution, PipelineStatus, StepRecord, StoredResult, Submission, SubmissionRequest,
    SubmissionStatus,
};
use crate::pipeline::{CancelFlag, Context, GradingPipeline};
use crate::sandbox::SandboxPool;
use crate::storage::Repository;
use crate::templates::{TemplateRegistry, TestServices};

/// Executor sizing and per-submission budget.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum pipelines running simultaneously. Should match or exceed the
    /// sum of per-language pool sizes so acquisitions don't starve.
    pub max_concurrent: usize,
    /// Overall wall-time budget per submission.
    pub submission_budget: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            submission_budget: Duration::from_secs(300),
        }
    }
}

impl CoordinatorConfig {
    /// Sizes the executor from the pool configuration.
    pub fn for_pool(pool: &SandboxPool) -> Self {
        Self {
            max_concurrent: pool.config().total_pool_size().max(1),
            ..Default::default()
        }
    }
}

/// What `poll` returns: the submission record plus, once terminal, the
/// result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionView {
    pub submission: Submission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StoredResult>,
}

/// Accepts submissions and runs grading pipelines in the background.
pub struct Coordinator {
    repository: Arc<dyn Repository>,
    registry: Arc<TemplateRegistry>,
    pool: Option<SandboxPool>,
    services: TestServices,
    feedback_producer: Arc<dyn FeedbackProducer>,
    semaphore: Arc<Semaphore>,
    config: CoordinatorConfig,
    cancels: Arc<Mutex<HashMap<Uuid, CancelFlag>>>,
}

impl Coordinator {
    pub fn new(
        repository: Arc<dyn Repository>,
        registry: Arc<TemplateRegistry>,
        pool: Option<SandboxPool>,
        services: TestServices,
        feedback_producer: Arc<dyn FeedbackProducer>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            pool,
            services,
            feedback_producer,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validates and enqueues a submission; returns its id immediately.
    pub async fn submit(&self, request: SubmissionRequest) -> Result<Uuid, CoordinatorError> {
        if request.files.is_empty() {
            return Err(CoordinatorError::Validation(
                "submission contains no files".to_string(),
            ));
        }
        if request.files.iter().any(|f| f.filename.trim().is_empty()) {
            return Err(CoordinatorError::Validation(
                "submission contains a file with an empty name".to_string(),
            ));
        }

        let config = self
            .repository
            .get_active_config(&request.assignment_id)
            .await?
            .ok_or_else(|| CoordinatorError::UnknownAssignment(request.assignment_id.clone()))?;

        if let Some(language) = &request.language {
            if !config.languages.is_empty() && !config.languages.contains(language) {
                return Err(CoordinatorError::UnsupportedLanguage {
                    language: language.clone(),
                    assignment: request.assignment_id.clone(),
                });
            }
        } else if config.languages.len() > 1 {
            return Err(CoordinatorError::Validation(format!(
                "assignment '{}' supports multiple languages; one must be chosen",
                request.assignment_id
            )));
        }

        let submission = Submission::from_request(request);
        let id = submission.id;
        self.repository.create_submission(&submission).await?;

        let cancel = CancelFlag::new();
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.insert(id, cancel.clone());
        }

        let template_name = config.effective_template().to_string();
        let task = GradingTask {
            repository: Arc::clone(&self.repository),
            registry: Arc::clone(&self.registry),
            pool: self.pool.clone(),
            services: self.services.clone(),
            feedback_producer: Arc::clone(&self.feedback_producer),
            semaphore: Arc::clone(&self.semaphore),
            cancels: Arc::clone(&self.cancels),
            budget: self.config.submission_budget,
            template_name,
        };

        tokio::spawn(async move {
            task.run(submission, cancel).await;
        });

        tracing::info!(submission = %id, "Submission accepted");
        Ok(id)
    }

    /// The current submission record, with the result once terminal.
    pub async fn poll(&self, id: Uuid) -> Result<SubmissionView, CoordinatorError> {
        let submission = self
            .repository
            .get_submission(id)
            .await?
            .ok_or_else(|| {
                CoordinatorError::Storage(crate::error::StorageError::NotFound(format!(
                    "submission {id}"
                )))
            })?;

        let result = if submission.status.is_terminal() {
            self.repository.get_result(id).await?
        } else {
            None
        };

        Ok(SubmissionView { submission, result })
    }

    /// Cancels a submission. Pending submissions never run; in-flight
    /// pipelines observe the flag at their next cooperation point.
    pub async fn cancel(&self, id: Uuid) -> Result<(), CoordinatorError> {
        if let Ok(cancels) = self.cancels.lock() {
            if let Some(flag) = cancels.get(&id) {
                flag.cancel();
            }
        }

        if let Some(submission) = self.repository.get_submission(id).await? {
            if submission.status == SubmissionStatus::Pending {
                self.repository
                    .update_status(id, SubmissionStatus::Cancelled)
                    .await?;
            }
        }

        tracing::info!(submission = %id, "Submission cancellation requested");
        Ok(())
    }
}

/// One background grading task.
struct GradingTask {
    repository: Arc<dyn Repository>,
    registry: Arc<TemplateRegistry>,
    pool: Option<SandboxPool>,
    services: TestServices,
    feedback_producer: Arc<dyn FeedbackProducer>,
    semaphore: Arc<Semaphore>,
    cancels: Arc<Mutex<HashMap<Uuid, CancelFlag>>>,
    budget: Duration,
    template_name: String,
}

impl GradingTask {
    async fn run(self, submission: Submission, cancel: CancelFlag) {
        let id = submission.id;

        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        // Cancelled while queued: never run the pipeline.
        let was_cancelled = cancel.is_cancelled()
            || matches!(
                self.repository.get_submission(id).await,
                Ok(Some(s)) if s.status == SubmissionStatus::Cancelled
            );
        if was_cancelled {
            let _ = self
                .repository
                .update_status(id, SubmissionStatus::Cancelled)
                .await;
            self.forget_cancel(id);
            tracing::info!(submission = %id, "Cancelled before start");
            return;
        }

        if let Err(e) = self
            .repository
            .update_status(id, SubmissionStatus::Running)
            .await
        {
            tracing::error!(submission = %id, error = %e, "Failed to mark submission running");
        }

        let mut ctx = Context::new(
            submission,
            Arc::clone(&self.repository),
            Arc::clone(&self.registry),
            self.pool.clone(),
            self.services.clone(),
            Arc::clone(&self.feedback_producer),
            self.budget,
        );
        ctx.cancel = cancel;

        // The engine enforces the budget at step boundaries; this hard cap
        // only fires if a step wedges past it.
        let hard_cap = self.budget + Duration::from_secs(30);
        let execution = match tokio::time::timeout(hard_cap, GradingPipeline::run(&mut ctx)).await
        {
            Ok(execution) => execution,
            Err(_) => {
                tracing::error!(submission = %id, "Pipeline exceeded hard wall-time cap");
                if let Some(lease) = ctx.sandbox.take() {
                    lease.taint();
                    lease.release().await;
                }
                timed_out_execution(self.budget + Duration::from_secs(30))
            }
        };

        let status = match execution.status {
            PipelineStatus::Success => SubmissionStatus::Completed,
            PipelineStatus::Failed => SubmissionStatus::Failed,
            PipelineStatus::Cancelled => SubmissionStatus::Cancelled,
        };

        let feedback = ctx.feedback.take().or_else(|| {
            (status != SubmissionStatus::Completed).then(|| failure_feedback(&execution))
        });
        let final_score = ctx
            .result_tree
            .as_ref()
            .map(|t| t.final_score)
            .unwrap_or(0.0);

        let stored = StoredResult {
            submission_id: id,
            result_tree: ctx.result_tree.take(),
            focus: ctx.focus.take(),
            feedback,
            feedback_degraded: ctx.feedback_degraded,
            execution,
            final_score,
            updated_at: Utc::now(),
        };

        if let Err(e) = self.repository.save_result(&stored, status).await {
            tracing::error!(submission = %id, error = %e, "Failed to persist grading result");
        }

        crate::metrics::observe_submission(&status.to_string(), &self.template_name);
        self.forget_cancel(id);

        tracing::info!(
            submission = %id,
            status = %status,
            final_score,
            "Submission finished"
        );
    }

    fn forget_cancel(&self, id: Uuid) {
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.remove(&id);
        }
    }
}

/// Synthetic trace for a run killed by the hard wall-time cap.
fn timed_out_execution(cap: Duration) -> PipelineExecution {
    let planned = GradingPipeline::steps();
    let steps: Vec<StepRecord> = planned
        .iter()
        .map(|s| StepRecord::not_run(s.name()))
        .collect();

    PipelineExecution {
        total_steps: planned.len(),
        steps_completed: 0,
        status: PipelineStatus::Failed,
        failed_at_step: None,
        duration_ms: cap.as_millis() as u64,
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::ReportFormatter;
    use crate::models::{CriteriaConfig, GradingConfig, SubmissionFile};
    use crate::storage::MemoryRepository;
    use serde_json::json;

    fn webdev_config(assignment: &str) -> GradingConfig {
        let criteria: CriteriaConfig = serde_json::from_value(json!({
            "base": {
                "weight": 100,
                "tests": [{"name": "has_tag", "parameters": [
                    {"name": "tag", "value": "main"}
                ]}]
            }
        }))
        .unwrap();
        GradingConfig::new(assignment, "webdev", criteria)
    }

    fn coordinator(repository: Arc<MemoryRepository>) -> Coordinator {
        Coordinator::new(
            repository,
            Arc::new(TemplateRegistry::builtin()),
            None,
            TestServices::new(),
            Arc::new(ReportFormatter::new().unwrap()),
            CoordinatorConfig::default(),
        )
    }

    fn request(assignment: &str) -> SubmissionRequest {
        SubmissionRequest {
            assignment_id: assignment.to_string(),
            user_id: "u1".to_string(),
            username: "ada".to_string(),
            language: None,
            files: vec![SubmissionFile::new("index.html", "<main>hi</main>")],
        }
    }

    async fn wait_terminal(coordinator: &Coordinator, id: Uuid) -> SubmissionView {
        for _ in 0..100 {
            let view = coordinator.poll(id).await.unwrap();
            if view.submission.status.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("submission {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_grades_in_background() {
        let repository = Arc::new(MemoryRepository::new());
        repository
            .create_config(webdev_config("a1"))
            .await
            .unwrap();
        let coordinator = coordinator(Arc::clone(&repository));

        let id = coordinator.submit(request("a1")).await.unwrap();
        let view = wait_terminal(&coordinator, id).await;

        assert_eq!(view.submission.status, SubmissionStatus::Completed);
        let result = view.result.unwrap();
        assert_eq!(result.final_score, 100.0);
        assert!(result.feedback.is_some());
        assert_eq!(result.execution.status, PipelineStatus::Success);
    }

    #[tokio::test]
    async fn unknown_assignment_is_rejected_at_intake() {
        let coordinator = coordinator(Arc::new(MemoryRepository::new()));
        let err = coordinator.submit(request("nope")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownAssignment(_)));
    }

    #[tokio::test]
    async fn empty_submissions_are_rejected() {
        let repository = Arc::new(MemoryRepository::new());
        repository
            .create_config(webdev_config("a1"))
            .await
            .unwrap();
        let coordinator = coordinator(repository);

        let mut empty = request("a1");
        empty.files.clear();
        let err = coordinator.submit(empty).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected() {
        let repository = Arc::new(MemoryRepository::new());
        let config = webdev_config("a1")
            .with_languages(vec!["python".to_string(), "java".to_string()]);
        repository.create_config(config).await.unwrap();
        let coordinator = coordinator(repository);

        let mut req = request("a1");
        req.language = Some("rust".to_string());
        let err = coordinator.submit(req).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UnsupportedLanguage { .. }));

        // Multi-language assignments require a chosen language.
        let err = coordinator.submit(request("a1")).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_pending_submission_never_runs() {
        let repository = Arc::new(MemoryRepository::new());
        // A pending record with no task behind it (e.g. queued before a
        // restart).
        let submission = Submission::from_request(request("a1"));
        repository.create_submission(&submission).await.unwrap();

        let coordinator = coordinator(Arc::clone(&repository));
        coordinator.cancel(submission.id).await.unwrap();

        let stored = repository
            .get_submission(submission.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SubmissionStatus::Cancelled);
    }
}
