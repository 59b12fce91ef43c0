//! The ordered steps of the grading pipeline.
//!
//! `LOAD_CONFIG -> LOAD_TEMPLATE -> BUILD_TREE -> PRE_FLIGHT -> GRADE ->
//! FOCUS -> FEEDBACK -> EXPORT`. The first five fail fatally; focus runs
//! only when feedback is enabled; feedback and export soft-fail.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::criteria::build_tree;
use crate::error::ErrorKind;
use crate::feedback::{AiFeedbackProducer, FeedbackContext, FeedbackProducer, ReportFormatter};
use crate::grader;
use crate::models::{FeedbackMode, SetupSpec};
use crate::sandbox::RunOptions;
use crate::storage::Repository as _;

use super::context::Context;
use super::engine::{Step, StepFailure, StepOutcome};

/// `LOAD_CONFIG`: resolve the assignment's active grading config.
pub struct LoadConfigStep;

#[async_trait]
impl Step for LoadConfigStep {
    fn name(&self) -> &'static str {
        "LOAD_CONFIG"
    }

    async fn execute(&self, ctx: &mut Context) -> StepOutcome {
        let assignment_id = ctx.submission.assignment_id.clone();
        match ctx.repository.get_active_config(&assignment_id).await {
            Ok(Some(config)) => {
                ctx.config = Some(config);
                StepOutcome::Ok
            }
            Ok(None) => StepOutcome::Fail(StepFailure::fatal(
                ErrorKind::ConfigMissing,
                format!("No active grading config for assignment '{assignment_id}'"),
            )),
            Err(e) => StepOutcome::Fail(StepFailure::fatal(
                ErrorKind::InternalError,
                format!("Failed to load grading config: {e}"),
            )),
        }
    }
}

/// `LOAD_TEMPLATE`: resolve the test library the rubric draws from.
pub struct LoadTemplateStep;

#[async_trait]
impl Step for LoadTemplateStep {
    fn name(&self) -> &'static str {
        "LOAD_TEMPLATE"
    }

    async fn execute(&self, ctx: &mut Context) -> StepOutcome {
        let Some(config) = ctx.config.as_ref() else {
            return missing_state("grading config");
        };

        let name = config.effective_template().to_string();
        match ctx.registry.get(&name) {
            Some(template) => {
                ctx.template = Some(template);
                StepOutcome::Ok
            }
            None => StepOutcome::Fail(StepFailure::fatal(
                ErrorKind::TemplateUnknown,
                format!(
                    "Unknown template '{name}'; registered templates: {}",
                    ctx.registry.names().join(", ")
                ),
            )),
        }
    }
}

/// `BUILD_TREE`: parse the rubric into the typed criteria tree, resolving
/// every test name and per-language command.
pub struct BuildTreeStep;

#[async_trait]
impl Step for BuildTreeStep {
    fn name(&self) -> &'static str {
        "BUILD_TREE"
    }

    async fn execute(&self, ctx: &mut Context) -> StepOutcome {
        let Some(config) = ctx.config.as_ref() else {
            return missing_state("grading config");
        };
        let Some(template) = ctx.template.as_ref() else {
            return missing_state("template");
        };

        let language = ctx.effective_language();
        match build_tree(&config.criteria, template, language.as_deref()) {
            Ok(tree) => {
                ctx.tree = Some(tree);
                StepOutcome::Ok
            }
            Err(e) => StepOutcome::Fail(StepFailure::fatal(
                ErrorKind::TreeMalformed,
                e.to_string(),
            )),
        }
    }
}

/// `PRE_FLIGHT`: verify required files, acquire a sandbox when the template
/// needs one, inject the submission, and run setup commands.
pub struct PreflightStep;

#[async_trait]
impl Step for PreflightStep {
    fn name(&self) -> &'static str {
        "PRE_FLIGHT"
    }

    async fn execute(&self, ctx: &mut Context) -> StepOutcome {
        let Some(config) = ctx.config.as_ref() else {
            return missing_state("grading config");
        };
        let Some(template) = ctx.template.as_ref() else {
            return missing_state("template");
        };

        let language = ctx.effective_language();
        let setup: Option<SetupSpec> = config
            .setup
            .as_ref()
            .and_then(|s| s.for_language(language.as_deref()))
            .cloned();
        let requires_sandbox = template.requires_sandbox();

        // (a) Every declared required file must be present.
        if let Some(spec) = &setup {
            let missing: Vec<&str> = spec
                .required_files
                .iter()
                .filter(|name| !ctx.submission.files.contains_key(name.as_str()))
                .map(String::as_str)
                .collect();

            if !missing.is_empty() {
                return StepOutcome::Fail(
                    StepFailure::fatal(
                        ErrorKind::PreflightMissingFile,
                        format!(
                            "Required file(s) missing from the submission: {}",
                            missing.join(", ")
                        ),
                    )
                    .with_details(json!({ "missing_files": missing })),
                );
            }
        }

        if !requires_sandbox {
            return StepOutcome::Ok;
        }

        // (b) Acquire an environment and stage the submission.
        let Some(pool) = ctx.pool.clone() else {
            return StepOutcome::Fail(StepFailure::fatal(
                ErrorKind::SandboxUnavailable,
                "This assignment needs a sandbox but no pool is configured",
            ));
        };

        let language_key = match language
            .or_else(|| pool.config().languages.keys().next().cloned())
        {
            Some(key) => key,
            None => {
                return StepOutcome::Fail(StepFailure::fatal(
                    ErrorKind::SandboxUnavailable,
                    "No sandbox language configured",
                ));
            }
        };

        let deadline = pool.config().acquire_deadline().min(ctx.remaining_budget());
        let lease = match pool.acquire(&language_key, deadline).await {
            Ok(lease) => lease,
            Err(e) => {
                return StepOutcome::Fail(StepFailure::fatal(
                    ErrorKind::SandboxUnavailable,
                    format!("Could not acquire a sandbox for '{language_key}': {e}"),
                ));
            }
        };

        if let Err(e) = lease.inject_files(&ctx.submission.files).await {
            lease.taint();
            lease.release().await;
            return StepOutcome::Fail(StepFailure::fatal(
                ErrorKind::InternalError,
                format!("Failed to stage submission files: {e}"),
            ));
        }

        ctx.sandbox = Some(lease);

        // (c) Run setup commands in order, checking cancellation at every
        // command return.
        let commands = setup.map(|s| s.setup_commands).unwrap_or_default();
        for command in &commands {
            if ctx.cancel.is_cancelled() {
                return StepOutcome::Fail(StepFailure::fatal(
                    ErrorKind::Cancelled,
                    "submission cancelled during setup",
                ));
            }

            let deadline = pool.config().setup_deadline().min(ctx.remaining_budget());
            let opts = RunOptions::default().with_deadline(deadline);
            let Some(lease) = ctx.sandbox.as_ref() else {
                return missing_state("sandbox lease");
            };

            match lease.run(command.command(), &opts).await {
                Ok(output) if output.success() => {
                    tracing::debug!(command = command.name(), "Setup command succeeded");
                }
                Ok(output) => {
                    return StepOutcome::Fail(
                        StepFailure::fatal(
                            ErrorKind::PreflightSetupFailed,
                            format!(
                                "Setup command '{}' exited with code {}",
                                command.name(),
                                output.exit_code
                            ),
                        )
                        .with_details(json!({
                            "command": command.command(),
                            "exit_code": output.exit_code,
                            "stdout": output.stdout,
                            "stderr": output.stderr,
                        })),
                    );
                }
                Err(crate::error::SandboxError::ExecTimeout { seconds }) => {
                    return StepOutcome::Fail(
                        StepFailure::fatal(
                            ErrorKind::ExecTimeout,
                            format!(
                                "Setup command '{}' timed out after {seconds} seconds",
                                command.name()
                            ),
                        )
                        .with_details(json!({ "command": command.command() })),
                    );
                }
                Err(e) => {
                    return StepOutcome::Fail(StepFailure::fatal(
                        ErrorKind::PreflightSetupFailed,
                        format!("Setup command '{}' failed: {e}", command.name()),
                    ));
                }
            }
        }

        StepOutcome::Ok
    }
}

/// `GRADE`: traverse the tree, execute tests, attach the result tree.
pub struct GradeStep;

#[async_trait]
impl Step for GradeStep {
    fn name(&self) -> &'static str {
        "GRADE"
    }

    async fn execute(&self, ctx: &mut Context) -> StepOutcome {
        let Some(tree) = ctx.tree.as_ref() else {
            return missing_state("criteria tree");
        };

        let result = grader::grade_from_tree(
            tree,
            &ctx.submission.files,
            ctx.sandbox.as_ref(),
            &ctx.services,
        )
        .await;

        tracing::info!(
            submission = %ctx.submission.id,
            final_score = result.final_score,
            "Submission graded"
        );
        ctx.result_tree = Some(result);
        StepOutcome::Ok
    }
}

/// `FOCUS`: rank tests by their contribution to the score deficit.
pub struct FocusStep;

#[async_trait]
impl Step for FocusStep {
    fn name(&self) -> &'static str {
        "FOCUS"
    }

    async fn execute(&self, ctx: &mut Context) -> StepOutcome {
        if !ctx.feedback_enabled() {
            return StepOutcome::Skip("feedback disabled for this assignment".to_string());
        }
        let Some(result_tree) = ctx.result_tree.as_ref() else {
            return missing_state("result tree");
        };

        ctx.focus = Some(crate::focus::compute(result_tree));
        StepOutcome::Ok
    }
}

/// `FEEDBACK`: turn the result tree and focus into prose. Soft-fails into
/// the deterministic formatter.
pub struct FeedbackStep;

#[async_trait]
impl Step for FeedbackStep {
    fn name(&self) -> &'static str {
        "FEEDBACK"
    }

    async fn execute(&self, ctx: &mut Context) -> StepOutcome {
        if !ctx.feedback_enabled() {
            return StepOutcome::Skip("feedback disabled for this assignment".to_string());
        }
        let Some(result_tree) = ctx.result_tree.as_ref() else {
            return missing_state("result tree");
        };

        let mode = ctx
            .config
            .as_ref()
            .map(|c| c.feedback.mode)
            .unwrap_or_default();

        let producer: Arc<dyn FeedbackProducer> = match mode {
            FeedbackMode::Ai => match ctx.services.ai.clone() {
                Some(provider) => match AiFeedbackProducer::new(provider) {
                    Ok(producer) => Arc::new(producer),
                    Err(e) => return degraded_feedback(ctx, format!("AI producer setup: {e}")),
                },
                None => {
                    return degraded_feedback(
                        ctx,
                        "AI feedback requested but no provider is configured".to_string(),
                    );
                }
            },
            FeedbackMode::Default => Arc::clone(&ctx.feedback_producer),
        };

        let feedback_ctx = FeedbackContext {
            tree: result_tree,
            focus: ctx.focus.as_ref(),
            username: &ctx.submission.username,
            assignment_id: &ctx.submission.assignment_id,
        };

        let budget = ctx.remaining_budget().min(Duration::from_secs(90));
        match tokio::time::timeout(budget, producer.produce(feedback_ctx)).await {
            Ok(Ok(feedback)) => {
                ctx.feedback = Some(feedback);
                StepOutcome::Ok
            }
            Ok(Err(e)) => degraded_feedback(ctx, e.to_string()),
            Err(_) => degraded_feedback(ctx, "feedback generation timed out".to_string()),
        }
    }
}

/// Falls back to the deterministic report and records a soft failure.
fn degraded_feedback(ctx: &mut Context, reason: String) -> StepOutcome {
    ctx.feedback_degraded = true;
    crate::metrics::inc_feedback_degraded();

    if let (Some(result_tree), Ok(formatter)) = (ctx.result_tree.as_ref(), ReportFormatter::new())
    {
        if let Ok(fallback) = formatter.render(result_tree, ctx.focus.as_ref()) {
            ctx.feedback = Some(fallback);
        }
    }

    StepOutcome::Fail(StepFailure::soft(
        ErrorKind::FeedbackFailed,
        format!("Feedback producer failed, degraded report used: {reason}"),
    ))
}

/// `EXPORT`: deliver the result to the configured webhook, if any.
pub struct ExportStep;

#[async_trait]
impl Step for ExportStep {
    fn name(&self) -> &'static str {
        "EXPORT"
    }

    async fn execute(&self, ctx: &mut Context) -> StepOutcome {
        let Some(url) = ctx
            .config
            .as_ref()
            .and_then(|c| c.feedback.export_url.clone())
        else {
            return StepOutcome::Skip("no export sink configured".to_string());
        };

        let payload = json!({
            "submission_id": ctx.submission.id,
            "assignment_id": ctx.submission.assignment_id,
            "user_id": ctx.submission.user_id,
            "username": ctx.submission.username,
            "final_score": ctx.result_tree.as_ref().map(|t| t.final_score),
            "feedback": ctx.feedback,
        });

        let request = ctx
            .services
            .http
            .post(&url)
            .timeout(Duration::from_secs(10))
            .json(&payload);

        match request.send().await {
            Ok(response) if response.status().is_success() => StepOutcome::Ok,
            Ok(response) => StepOutcome::Fail(StepFailure::soft(
                ErrorKind::ExportFailed,
                format!("Export sink returned {}", response.status()),
            )),
            Err(e) => StepOutcome::Fail(StepFailure::soft(
                ErrorKind::ExportFailed,
                format!("Export request failed: {e}"),
            )),
        }
    }
}

fn missing_state(what: &str) -> StepOutcome {
    StepOutcome::Fail(StepFailure::fatal(
        ErrorKind::InternalError,
        format!("pipeline invariant violated: {what} not available"),
    ))
}
