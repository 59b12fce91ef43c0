//! Deterministic feedback rendering.
//!
//! The default producer flattens the result tree into display lines and
//! renders them through a tera template. Failed pipelines get a prose
//! explanation assembled from the failing step's record instead.

use serde::Serialize;
use tera::Tera;

use crate::error::FeedbackError;
use crate::focus::Focus;
use crate::models::{PipelineExecution, ResultChild, ResultNode, ResultTree, TestStatus};

const REPORT_TEMPLATE: &str = "\
Final score: {{ final_score }} / 100

{% for section in sections -%}
## {{ section.title }} ({{ section.score }}/100)
{% for line in section.lines -%}
{{ line.indent }}{{ line.marker }} {{ line.label }}: {{ line.score }}/100{% if line.report %} - {{ line.report }}{% endif %}
{% endfor %}
{% endfor -%}
{% if focus_lines -%}
## Where to focus
{% for line in focus_lines -%}
- {{ line }}
{% endfor %}
{% endif -%}";

#[derive(Serialize)]
struct Section {
    title: String,
    score: String,
    lines: Vec<Line>,
}

#[derive(Serialize)]
struct Line {
    indent: String,
    marker: &'static str,
    label: String,
    score: String,
    report: String,
}

/// Renders a graded result tree into a plain-text report.
pub struct ReportFormatter {
    tera: Tera,
}

impl ReportFormatter {
    pub fn new() -> Result<Self, FeedbackError> {
        let mut tera = Tera::default();
        tera.add_raw_template("report", REPORT_TEMPLATE)?;
        Ok(Self { tera })
    }

    /// Produces the full report text.
    pub fn render(&self, tree: &ResultTree, focus: Option<&Focus>) -> Result<String, FeedbackError> {
        let mut sections = Vec::new();
        for (title, node) in [
            ("Base", tree.base.as_ref()),
            ("Bonus", tree.bonus.as_ref()),
            ("Penalty", tree.penalty.as_ref()),
        ] {
            if let Some(node) = node {
                sections.push(Section {
                    title: title.to_string(),
                    score: format_score(node.score),
                    lines: flatten(node),
                });
            }
        }

        let focus_lines: Vec<String> = focus
            .map(|f| {
                f.base
                    .iter()
                    .take(5)
                    .map(|entry| {
                        format!(
                            "{} is costing you {:.1} points: {}",
                            entry.test.name,
                            entry.diff_score,
                            short(&entry.test.report)
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut context = tera::Context::new();
        context.insert("final_score", &format_score(tree.final_score));
        context.insert("sections", &sections);
        context.insert("focus_lines", &focus_lines);

        Ok(self.tera.render("report", &context)?)
    }
}

fn flatten(node: &ResultNode) -> Vec<Line> {
    let mut lines = Vec::new();
    flatten_into(node, 0, &mut lines);
    lines
}

fn flatten_into(node: &ResultNode, depth: usize, out: &mut Vec<Line>) {
    for child in &node.children {
        match child {
            ResultChild::Subject(sub) => {
                out.push(Line {
                    indent: "  ".repeat(depth),
                    marker: "*",
                    label: sub.name.clone(),
                    score: format_score(sub.score),
                    report: String::new(),
                });
                flatten_into(sub, depth + 1, out);
            }
            ResultChild::Test(leaf) => {
                out.push(Line {
                    indent: "  ".repeat(depth),
                    marker: status_marker(leaf.status),
                    label: leaf.name.clone(),
                    score: format_score(leaf.score),
                    report: short(&leaf.report),
                });
            }
        }
    }
}

fn status_marker(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Pass => "[pass]",
        TestStatus::Partial => "[partial]",
        TestStatus::Fail => "[fail]",
        TestStatus::Error => "[error]",
    }
}

fn format_score(score: f64) -> String {
    if (score - score.round()).abs() < 1e-9 {
        format!("{}", score.round() as i64)
    } else {
        format!("{score:.1}")
    }
}

fn short(text: &str) -> String {
    const MAX: usize = 160;
    let text = text.trim().replace('\n', " ");
    if text.chars().count() <= MAX {
        text
    } else {
        let truncated: String = text.chars().take(MAX).collect();
        format!("{truncated}...")
    }
}

/// Prose for a pipeline that never produced a result tree.
///
/// Names the failing step and folds in whatever stdout/stderr the step
/// recorded, so a student sees the compiler error rather than a bare status.
pub fn failure_feedback(execution: &PipelineExecution) -> String {
    let Some(failed) = execution.failure() else {
        return "Grading did not complete; no further details are available.".to_string();
    };

    let mut out = format!("Grading stopped at step {}.", failed.name);

    if let Some(error) = &failed.error {
        out.push_str(&format!(" {}", error.message));
        if let Some(details) = &error.details {
            if let Some(stderr) = details.get("stderr").and_then(|v| v.as_str()) {
                if !stderr.trim().is_empty() {
                    out.push_str(&format!("\n\nError output:\n{}", stderr.trim()));
                }
            }
            if let Some(stdout) = details.get("stdout").and_then(|v| v.as_str()) {
                if !stdout.trim().is_empty() {
                    out.push_str(&format!("\n\nProgram output:\n{}", stdout.trim()));
                }
            }
        }
    } else if let Some(message) = &failed.message {
        out.push_str(&format!(" {message}"));
    }

    out
}
