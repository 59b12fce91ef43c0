//! The step engine: ordered execution with per-step status tracking.
//!
//! The engine runs steps sequentially and always produces a complete
//! [`PipelineExecution`] covering every planned step. Fatal failures halt
//! the run and mark the remaining steps `not_run`; soft failures are
//! recorded and execution continues. Panics inside a step are caught at the
//! step boundary and converted to fatal `internal_error` outcomes, so a
//! misbehaving test can never take the service down.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::error::ErrorKind;
use crate::models::{PipelineExecution, PipelineStatus, StepError, StepRecord, StepStatus};

use super::context::Context;

/// How bad a step failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Halts the pipeline; subsequent steps never run.
    Fatal,
    /// Recorded, but execution continues.
    Soft,
}

/// A step failure with its client-facing classification.
#[derive(Debug)]
pub struct StepFailure {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl StepFailure {
    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn soft(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Soft,
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Outcome of one step execution.
#[derive(Debug)]
pub enum StepOutcome {
    Ok,
    Skip(String),
    Fail(StepFailure),
}

/// One unit of pipeline work.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut Context) -> StepOutcome;
}

/// Runs the steps in order against the context.
pub async fn run_steps(steps: &[Box<dyn Step>], ctx: &mut Context) -> PipelineExecution {
    let started = Instant::now();
    let total_steps = steps.len();

    let mut records: Vec<StepRecord> = Vec::with_capacity(total_steps);
    let mut status = PipelineStatus::Success;
    let mut failed_at_step = None;
    let mut halted_at = None;

    for (index, step) in steps.iter().enumerate() {
        // Cooperation point: cancellation and the submission budget are
        // checked between steps, never mid-step.
        if ctx.cancel.is_cancelled() {
            tracing::info!(step = step.name(), "Pipeline cancelled");
            records.push(StepRecord {
                name: step.name().to_string(),
                status: StepStatus::Cancelled,
                duration_ms: 0,
                message: Some("submission cancelled".to_string()),
                error: Some(StepError {
                    kind: ErrorKind::Cancelled,
                    message: "submission cancelled".to_string(),
                    details: None,
                }),
            });
            status = PipelineStatus::Cancelled;
            failed_at_step = Some(step.name().to_string());
            halted_at = Some(index + 1);
            break;
        }

        if ctx.remaining_budget().is_zero() {
            records.push(StepRecord {
                name: step.name().to_string(),
                status: StepStatus::Failed,
                duration_ms: 0,
                message: Some("submission wall-time budget exhausted".to_string()),
                error: Some(StepError {
                    kind: ErrorKind::ExecTimeout,
                    message: "submission wall-time budget exhausted".to_string(),
                    details: None,
                }),
            });
            status = PipelineStatus::Failed;
            failed_at_step = Some(step.name().to_string());
            halted_at = Some(index + 1);
            break;
        }

        let step_started = Instant::now();
        let outcome = match AssertUnwindSafe(step.execute(ctx)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(step = step.name(), panic = %message, "Step panicked");
                StepOutcome::Fail(StepFailure::fatal(
                    ErrorKind::InternalError,
                    format!("step panicked: {message}"),
                ))
            }
        };
        let duration_ms = step_started.elapsed().as_millis() as u64;
        crate::metrics::observe_step(step.name(), step_started.elapsed().as_secs_f64());

        match outcome {
            StepOutcome::Ok => {
                tracing::debug!(step = step.name(), duration_ms, "Step succeeded");
                records.push(StepRecord {
                    name: step.name().to_string(),
                    status: StepStatus::Success,
                    duration_ms,
                    message: None,
                    error: None,
                });
            }
            StepOutcome::Skip(reason) => {
                tracing::debug!(step = step.name(), reason = %reason, "Step skipped");
                records.push(StepRecord {
                    name: step.name().to_string(),
                    status: StepStatus::Skipped,
                    duration_ms,
                    message: Some(reason),
                    error: None,
                });
            }
            StepOutcome::Fail(failure) => {
                tracing::warn!(
                    step = step.name(),
                    kind = %failure.kind,
                    severity = ?failure.severity,
                    message = %failure.message,
                    "Step failed"
                );
                // A step observing cancellation mid-work (between sandbox
                // commands) reports it as a Cancelled-kind failure.
                let cancelled = failure.kind == ErrorKind::Cancelled;
                records.push(StepRecord {
                    name: step.name().to_string(),
                    status: if cancelled {
                        StepStatus::Cancelled
                    } else {
                        StepStatus::Failed
                    },
                    duration_ms,
                    message: Some(failure.message.clone()),
                    error: Some(StepError {
                        kind: failure.kind,
                        message: failure.message,
                        details: failure.details,
                    }),
                });

                if failure.severity == Severity::Fatal {
                    status = if cancelled {
                        PipelineStatus::Cancelled
                    } else {
                        PipelineStatus::Failed
                    };
                    failed_at_step = Some(step.name().to_string());
                    halted_at = Some(index + 1);
                    break;
                }
            }
        }
    }

    // Every planned step appears in the record, reached or not.
    if let Some(halted_at) = halted_at {
        for step in &steps[halted_at..] {
            records.push(StepRecord::not_run(step.name()));
        }
    }

    let steps_completed = records
        .iter()
        .filter(|r| matches!(r.status, StepStatus::Success | StepStatus::Skipped))
        .count();

    PipelineExecution {
        total_steps,
        steps_completed,
        status,
        failed_at_step,
        duration_ms: started.elapsed().as_millis() as u64,
        steps: records,
    }
}
