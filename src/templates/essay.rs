//! AI-graded essay criteria. Each test wraps its prompt and the submission
//! into a chat completion; the model returns a score and a comment.

use std::sync::Arc;

use serde::Deserialize;

use crate::feedback::ChatProvider as _;
use crate::models::{TestResult, TestStatus};

use super::params::Params;
use super::{Template, TestFn, TestFuture, TestInvocation};

/// Builds the `essay` template.
pub fn template() -> Template {
    Template::new("essay", false).register("ai_criterion", Arc::new(AiCriterion))
}

const GRADING_SYSTEM_PROMPT: &str = "\
You grade one criterion of a student submission. You receive the criterion \
and the submitted files. Respond with a single JSON object and nothing \
else: {\"score\": <integer 0-100>, \"comment\": \"<one or two sentences \
justifying the score>\"}.";

#[derive(Debug, Deserialize)]
struct Verdict {
    score: f64,
    #[serde(default)]
    comment: String,
}

/// `ai_criterion(prompt, max_score?)`: delegates the judgement to the chat
/// provider. An optional `max_score` caps how many points the verdict can
/// award.
struct AiCriterion;

impl TestFn for AiCriterion {
    fn required_parameters(&self) -> &'static [&'static str] {
        &["prompt"]
    }

    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let params = Params::new(inv.parameters);
            let prompt = match params.str("prompt") {
                Ok(p) => p.to_string(),
                Err(e) => return e.into_result(),
            };
            let max_score = match params.opt_f64("max_score") {
                Ok(cap) => cap.unwrap_or(100.0).clamp(0.0, 100.0),
                Err(e) => return e.into_result(),
            };

            let Some(provider) = inv.services.ai.as_ref() else {
                return TestResult::error("AI grading is not configured for this deployment");
            };

            let mut user = format!("Criterion: {prompt}\n\nSubmission:\n");
            for (name, content) in inv.files {
                if let Some(target) = inv.file {
                    if target != name.as_str() {
                        continue;
                    }
                }
                user.push_str(&format!("--- {name} ---\n{content}\n"));
            }

            let answer = match provider.complete(GRADING_SYSTEM_PROMPT, &user).await {
                Ok(answer) => answer,
                Err(e) => {
                    return TestResult::error(format!("AI grading request failed: {e}"));
                }
            };

            let Some(verdict) = parse_verdict(&answer) else {
                return TestResult::error(format!(
                    "AI grading returned an unparseable verdict: {}",
                    answer.chars().take(200).collect::<String>()
                ));
            };

            let score = verdict.score.clamp(0.0, max_score);
            let report = if verdict.comment.is_empty() {
                format!("Scored {score:.0}/100")
            } else {
                verdict.comment
            };

            let status = if score >= 100.0 {
                TestStatus::Pass
            } else if score <= 0.0 {
                TestStatus::Fail
            } else {
                TestStatus::Partial
            };

            TestResult {
                status,
                score,
                report,
                telemetry: None,
            }
        })
    }
}

/// Extracts the first JSON object from the model's answer; models sometimes
/// wrap it in prose or a code fence.
fn parse_verdict(answer: &str) -> Option<Verdict> {
    if let Ok(verdict) = serde_json::from_str::<Verdict>(answer.trim()) {
        return Some(verdict);
    }

    let start = answer.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in answer[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &answer[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}
