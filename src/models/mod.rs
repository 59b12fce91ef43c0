//! Shared domain types: submissions, grading configs, result trees, and
//! pipeline execution records.

pub mod config;
pub mod execution;
pub mod result;
pub mod stored;
pub mod submission;

pub use config::{
    CategoryConfig, CriteriaConfig, FeedbackMode, FeedbackSettings, GradingConfig,
    ParameterConfig, SetupCommand, SetupConfig, SetupSpec, SubjectConfig, TestConfig,
};
pub use execution::{PipelineExecution, PipelineStatus, StepError, StepRecord, StepStatus};
pub use result::{ResultChild, ResultNode, ResultTree, Telemetry, TestLeaf, TestResult, TestStatus};
pub use stored::StoredResult;
pub use submission::{Submission, SubmissionFile, SubmissionRequest, SubmissionStatus};
