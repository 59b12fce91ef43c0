//! The shared mutable context a pipeline run threads through its steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::criteria::CriteriaTree;
use crate::feedback::FeedbackProducer;
use crate::focus::Focus;
use crate::models::{GradingConfig, ResultTree, Submission};
use crate::sandbox::{SandboxLease, SandboxPool};
use crate::storage::Repository;
use crate::templates::{Template, TemplateRegistry, TestServices};

/// Cooperative cancellation signal, checked at step boundaries and between
/// sandbox commands.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a grading run reads and accumulates.
///
/// Dependencies are injected up front; steps communicate exclusively
/// through the accumulator fields, each step observing its predecessors'
/// side effects.
pub struct Context {
    // Inputs.
    pub submission: Submission,
    pub repository: Arc<dyn Repository>,
    pub registry: Arc<TemplateRegistry>,
    pub pool: Option<SandboxPool>,
    pub services: TestServices,
    pub feedback_producer: Arc<dyn FeedbackProducer>,
    pub cancel: CancelFlag,
    /// Hard cap on the submission's total wall time.
    pub deadline: Instant,

    // Accumulators, populated in step order.
    pub config: Option<GradingConfig>,
    pub template: Option<Arc<Template>>,
    pub tree: Option<CriteriaTree>,
    pub sandbox: Option<SandboxLease>,
    pub result_tree: Option<ResultTree>,
    pub focus: Option<Focus>,
    pub feedback: Option<String>,
    pub feedback_degraded: bool,
}

impl Context {
    pub fn new(
        submission: Submission,
        repository: Arc<dyn Repository>,
        registry: Arc<TemplateRegistry>,
        pool: Option<SandboxPool>,
        services: TestServices,
        feedback_producer: Arc<dyn FeedbackProducer>,
        budget: Duration,
    ) -> Self {
        Self {
            submission,
            repository,
            registry,
            pool,
            services,
            feedback_producer,
            cancel: CancelFlag::new(),
            deadline: Instant::now() + budget,
            config: None,
            template: None,
            tree: None,
            sandbox: None,
            result_tree: None,
            focus: None,
            feedback: None,
            feedback_degraded: false,
        }
    }

    /// The language the submission is graded under: its own tag, or the
    /// config's first declared language for single-language assignments.
    pub fn effective_language(&self) -> Option<String> {
        self.submission.language.clone().or_else(|| {
            self.config
                .as_ref()
                .and_then(|c| c.languages.first().cloned())
        })
    }

    /// Wall time left in the submission budget.
    pub fn remaining_budget(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether feedback (and therefore focus) generation is enabled.
    pub fn feedback_enabled(&self) -> bool {
        self.config
            .as_ref()
            .map(|c| c.feedback.enabled)
            .unwrap_or(true)
    }
}
