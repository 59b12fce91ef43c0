//! The grading pipeline: ordered steps over a shared context.
//!
//! [`GradingPipeline::run`] executes the full step set and guarantees the
//! single most important resource invariant: a sandbox acquired in
//! pre-flight is released on every exit path, whether the run succeeded,
//! failed, was cancelled, or a step panicked.

pub mod context;
pub mod engine;
pub mod steps;

pub use context::{CancelFlag, Context};
pub use engine::{run_steps, Severity, Step, StepFailure, StepOutcome};

use crate::models::PipelineExecution;

/// The standard grading pipeline.
pub struct GradingPipeline;

impl GradingPipeline {
    /// The ordered step set.
    pub fn steps() -> Vec<Box<dyn Step>> {
        vec![
            Box::new(steps::LoadConfigStep),
            Box::new(steps::LoadTemplateStep),
            Box::new(steps::BuildTreeStep),
            Box::new(steps::PreflightStep),
            Box::new(steps::GradeStep),
            Box::new(steps::FocusStep),
            Box::new(steps::FeedbackStep),
            Box::new(steps::ExportStep),
        ]
    }

    /// Runs the pipeline to completion and releases any held sandbox.
    pub async fn run(ctx: &mut Context) -> PipelineExecution {
        let execution = run_steps(&Self::steps(), ctx).await;

        // The one release point for the normal paths; the lease's Drop
        // backstop covers abnormal ones.
        if let Some(lease) = ctx.sandbox.take() {
            lease.release().await;
        }

        execution
    }
}
