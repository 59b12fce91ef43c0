//! Result tree: the criteria tree annotated with execution outcomes.

use serde::{Deserialize, Serialize};

use super::config::ParameterConfig;

/// Outcome of a single test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Partial,
    Fail,
    Error,
}

/// Captured process output for sandbox-backed tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// The `(status, score, report)` triple a test function produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub status: TestStatus,
    /// Score in [0, 100].
    pub score: f64,
    /// Human-readable explanation of the outcome.
    pub report: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
}

impl TestResult {
    /// Full credit.
    pub fn pass(report: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Pass,
            score: 100.0,
            report: report.into(),
            telemetry: None,
        }
    }

    /// Zero credit.
    pub fn fail(report: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Fail,
            score: 0.0,
            report: report.into(),
            telemetry: None,
        }
    }

    /// Partial credit. The score is clamped to (0, 100); callers hitting the
    /// boundaries should use `pass`/`fail` instead.
    pub fn partial(score: f64, report: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Partial,
            score: score.clamp(0.0, 100.0),
            report: report.into(),
            telemetry: None,
        }
    }

    /// Infrastructure failure: scored 0, grading continues.
    pub fn error(report: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Error,
            score: 0.0,
            report: report.into(),
            telemetry: None,
        }
    }

    /// Attaches captured process output.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// A result-tree leaf: one executed test with its parameters and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLeaf {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterConfig>,
    pub status: TestStatus,
    pub score: f64,
    pub report: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Telemetry>,
}

impl TestLeaf {
    /// Combines a test's declaration with its execution result.
    pub fn new(name: impl Into<String>, parameters: Vec<ParameterConfig>, result: TestResult) -> Self {
        Self {
            name: name.into(),
            parameters,
            status: result.status,
            score: result.score,
            report: result.report,
            telemetry: result.telemetry,
        }
    }
}

/// An internal result node: a category root or subject with its effective
/// (post-normalization) weight and aggregated score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultNode {
    pub name: String,
    /// Effective weight after sibling normalization to 100.
    pub weight: f64,
    /// Aggregated score in [0, 100].
    pub score: f64,
    pub children: Vec<ResultChild>,
}

/// A result node's child: either a nested subject or an executed test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultChild {
    Subject(ResultNode),
    Test(TestLeaf),
}

impl ResultChild {
    /// The child's score, whichever variant it is.
    pub fn score(&self) -> f64 {
        match self {
            ResultChild::Subject(node) => node.score,
            ResultChild::Test(leaf) => leaf.score,
        }
    }
}

/// The full mirror of the criteria tree with scores attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultTree {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<ResultNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonus: Option<ResultNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty: Option<ResultNode>,
    /// The submission's final score in [0, 100].
    pub final_score: f64,
}

impl ResultTree {
    /// Visits every test leaf in a category in declaration order.
    pub fn leaves_of<'a>(node: &'a ResultNode, out: &mut Vec<&'a TestLeaf>) {
        for child in &node.children {
            match child {
                ResultChild::Test(leaf) => out.push(leaf),
                ResultChild::Subject(sub) => Self::leaves_of(sub, out),
            }
        }
    }
}
