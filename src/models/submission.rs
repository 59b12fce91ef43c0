//! Submission records: the unit of grading work.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubmissionStatus {
    /// Whether the submission has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed | SubmissionStatus::Failed | SubmissionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A student submission against an assignment.
///
/// Created by the API adapter, mutated only by the coordinator (status) and
/// the result writeback. Files are immutable once the pipeline starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub assignment_id: String,
    pub user_id: String,
    pub username: String,
    /// Chosen language tag for multi-language assignments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Ordered `filename -> content` map.
    pub files: IndexMap<String, String>,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
}

impl Submission {
    /// Builds a pending submission from an intake request.
    pub fn from_request(request: SubmissionRequest) -> Self {
        let files = request
            .files
            .into_iter()
            .map(|f| (f.filename, f.content))
            .collect();

        Self {
            id: Uuid::new_v4(),
            assignment_id: request.assignment_id,
            user_id: request.user_id,
            username: request.username,
            language: request.language,
            files,
            status: SubmissionStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// The intake request shape accepted by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub assignment_id: String,
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub files: Vec<SubmissionFile>,
}

/// One submitted file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionFile {
    pub filename: String,
    pub content: String,
}

impl SubmissionFile {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_request_preserves_file_order() {
        let request = SubmissionRequest {
            assignment_id: "a1".to_string(),
            user_id: "u1".to_string(),
            username: "ada".to_string(),
            language: Some("python".to_string()),
            files: vec![
                SubmissionFile::new("z.py", "pass"),
                SubmissionFile::new("a.py", "pass"),
                SubmissionFile::new("m.py", "pass"),
            ],
        };

        let submission = Submission::from_request(request);
        let names: Vec<&str> = submission.files.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["z.py", "a.py", "m.py"]);
        assert_eq!(submission.status, SubmissionStatus::Pending);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!SubmissionStatus::Pending.is_terminal());
        assert!(!SubmissionStatus::Running.is_terminal());
        assert!(SubmissionStatus::Completed.is_terminal());
        assert!(SubmissionStatus::Failed.is_terminal());
        assert!(SubmissionStatus::Cancelled.is_terminal());
    }
}
