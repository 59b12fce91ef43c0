//! Pipeline execution records: the observability trace of a grading run.
//!
//! Every pipeline run produces a complete [`PipelineExecution`] covering every
//! planned step, whatever the outcome. This record is the contract behind
//! user-visible failure reports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Status of a single pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Skipped,
    Failed,
    /// The step was planned but a prior fatal failure or cancellation
    /// prevented it from running.
    NotRun,
    Cancelled,
}

/// Overall outcome of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failed,
    Cancelled,
}

/// Structured error details attached to a failed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Record of one step's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepRecord {
    /// A planned step that never ran.
    pub fn not_run(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::NotRun,
            duration_ms: 0,
            message: None,
            error: None,
        }
    }
}

/// The complete trace of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub total_steps: usize,
    /// Steps that finished with `success` or `skipped`.
    pub steps_completed: usize,
    pub status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at_step: Option<String>,
    pub duration_ms: u64,
    pub steps: Vec<StepRecord>,
}

impl PipelineExecution {
    /// The first failed or cancelled step record, if any.
    pub fn failure(&self) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::Cancelled))
    }

    /// The first fatal step error, if any.
    pub fn first_error(&self) -> Option<&StepError> {
        self.steps.iter().find_map(|s| s.error.as_ref())
    }
}
