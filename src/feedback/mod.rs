//! Feedback producers: turning a graded result tree into prose.
//!
//! The default producer is the deterministic [`ReportFormatter`]; the AI
//! producer wraps a [`ChatProvider`] and soft-fails into the formatter when
//! the model is unreachable.

pub mod ai;
pub mod formatter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FeedbackError;
use crate::focus::Focus;
use crate::models::ResultTree;

pub use ai::{ChatMessage, ChatProvider, OpenAiChatClient};
pub use formatter::{failure_feedback, ReportFormatter};

/// Everything a producer may draw on.
pub struct FeedbackContext<'a> {
    pub tree: &'a ResultTree,
    pub focus: Option<&'a Focus>,
    pub username: &'a str,
    pub assignment_id: &'a str,
}

/// Produces the feedback string for a completed grading run.
#[async_trait]
pub trait FeedbackProducer: Send + Sync {
    async fn produce(&self, ctx: FeedbackContext<'_>) -> Result<String, FeedbackError>;
}

#[async_trait]
impl FeedbackProducer for ReportFormatter {
    async fn produce(&self, ctx: FeedbackContext<'_>) -> Result<String, FeedbackError> {
        self.render(ctx.tree, ctx.focus)
    }
}

const FEEDBACK_SYSTEM_PROMPT: &str = "\
You are a teaching assistant writing feedback on an automatically graded \
code submission. You receive the grading report. Write short, specific, \
encouraging feedback in prose: what worked, what cost points, and the one \
or two changes that would raise the score most. Do not invent results that \
are not in the report.";

/// AI-assisted feedback over an OpenAI-compatible endpoint.
pub struct AiFeedbackProducer {
    provider: Arc<dyn ChatProvider>,
    formatter: ReportFormatter,
    overall_timeout: Duration,
}

impl AiFeedbackProducer {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Result<Self, FeedbackError> {
        Ok(Self {
            provider,
            formatter: ReportFormatter::new()?,
            overall_timeout: Duration::from_secs(60),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = timeout;
        self
    }
}

#[async_trait]
impl FeedbackProducer for AiFeedbackProducer {
    async fn produce(&self, ctx: FeedbackContext<'_>) -> Result<String, FeedbackError> {
        let report = self.formatter.render(ctx.tree, ctx.focus)?;
        let prompt = format!(
            "Student: {}\nAssignment: {}\n\nGrading report:\n{}",
            ctx.username, ctx.assignment_id, report
        );

        match tokio::time::timeout(
            self.overall_timeout,
            self.provider.complete(FEEDBACK_SYSTEM_PROMPT, &prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FeedbackError::Timeout {
                seconds: self.overall_timeout.as_secs(),
            }),
        }
    }
}
