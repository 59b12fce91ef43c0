//! The persisted result payload for a graded submission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::focus::Focus;

use super::execution::PipelineExecution;
use super::result::ResultTree;

/// Everything the repository persists alongside a terminal submission:
/// the annotated result tree, the focus ranking, the feedback string, and
/// the pipeline trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub submission_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_tree: Option<ResultTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<Focus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Set when the feedback producer failed and a fallback was used.
    #[serde(default)]
    pub feedback_degraded: bool,
    pub execution: PipelineExecution,
    /// Final score in [0, 100]; 0 when grading never completed.
    pub final_score: f64,
    pub updated_at: DateTime<Utc>,
}
