//! Error types for gradeforge operations.
//!
//! Defines error types for all major subsystems:
//! - Rubric parsing and criteria tree construction
//! - Sandbox pool and container execution
//! - Grading and test execution
//! - Repository access
//! - Feedback generation
//! - Submission coordination
//!
//! The client-facing [`ErrorKind`] taxonomy maps these onto the stable
//! identifiers recorded in pipeline step failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, client-facing error identifiers recorded on failed pipeline steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No active grading config exists for the assignment.
    ConfigMissing,
    /// The template named by the config is not registered.
    TemplateUnknown,
    /// The rubric violates a structural invariant.
    TreeMalformed,
    /// A file declared in `required_files` is absent from the submission.
    PreflightMissingFile,
    /// A setup command exited non-zero.
    PreflightSetupFailed,
    /// Sandbox acquisition timed out.
    SandboxUnavailable,
    /// A command exceeded its execution deadline.
    ExecTimeout,
    /// A probe failed for environmental reasons; the test scored 0 but
    /// grading continued.
    TestInfrastructure,
    /// The feedback producer failed; grading continued with degraded feedback.
    FeedbackFailed,
    /// The export sink rejected the result; grading is unaffected.
    ExportFailed,
    /// The submission was cancelled.
    Cancelled,
    /// An unexpected failure inside a step, caught at the step boundary.
    InternalError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ConfigMissing => "config_missing",
            ErrorKind::TemplateUnknown => "template_unknown",
            ErrorKind::TreeMalformed => "tree_malformed",
            ErrorKind::PreflightMissingFile => "preflight_missing_file",
            ErrorKind::PreflightSetupFailed => "preflight_setup_failed",
            ErrorKind::SandboxUnavailable => "sandbox_unavailable",
            ErrorKind::ExecTimeout => "exec_timeout",
            ErrorKind::TestInfrastructure => "test_infrastructure",
            ErrorKind::FeedbackFailed => "feedback_failed",
            ErrorKind::ExportFailed => "export_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur while building a criteria tree from a rubric.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Test '{test}' not found in template '{template}'")]
    UnknownTest { test: String, template: String },

    #[error("Subject '{subject}' declares both subjects and tests")]
    MixedChildren { subject: String },

    #[error("Subject '{subject}' has non-positive weight {weight}")]
    NonPositiveWeight { subject: String, weight: f64 },

    #[error("Test '{test}' is missing required parameter '{parameter}'")]
    MissingParameter { test: String, parameter: String },

    #[error("Test '{test}' has no program command for language '{language}'")]
    MissingLanguageCommand { test: String, language: String },

    #[error("Parameter '{parameter}' of test '{test}' is malformed: {message}")]
    BadParameter {
        test: String,
        parameter: String,
        message: String,
    },

    #[error("Malformed rubric: {0}")]
    Malformed(String),
}

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("No sandbox available for language '{language}' within {waited:?}")]
    Unavailable { language: String, waited: Duration },

    #[error("Sandbox pool misconfigured: {0}")]
    Misconfigured(String),

    #[error("Command timed out after {seconds} seconds")]
    ExecTimeout { seconds: u64 },

    #[error("Sandbox environment crashed: {0}")]
    Crashed(String),

    #[error("No port mapping for container port {port}")]
    NoPort { port: u16 },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Pool is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while producing feedback.
#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("Missing API key: GRADEFORGE_AI_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base: GRADEFORGE_AI_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse model response: {0}")]
    ParseError(String),

    #[error("Feedback generation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Template rendering error: {0}")]
    Render(#[from] tera::Error),
}

/// Errors surfaced by the submission coordinator at intake time.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("No active grading config for assignment '{0}'")]
    UnknownAssignment(String),

    #[error("Language '{language}' is not supported by assignment '{assignment}'")]
    UnsupportedLanguage {
        language: String,
        assignment: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PreflightMissingFile).unwrap();
        assert_eq!(json, "\"preflight_missing_file\"");

        let back: ErrorKind = serde_json::from_str("\"sandbox_unavailable\"").unwrap();
        assert_eq!(back, ErrorKind::SandboxUnavailable);
    }

    #[test]
    fn error_kind_display_matches_serde() {
        for kind in [
            ErrorKind::ConfigMissing,
            ErrorKind::TemplateUnknown,
            ErrorKind::TreeMalformed,
            ErrorKind::ExecTimeout,
            ErrorKind::InternalError,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn tree_error_names_test_and_template() {
        let err = TreeError::UnknownTest {
            test: "has_tag".to_string(),
            template: "input_output".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("has_tag"));
        assert!(msg.contains("input_output"));
    }
}
