//! The grader: executes a criteria tree against a submission and produces
//! the annotated result tree.
//!
//! Traversal is post-order: tests run in declaration order, leaf subjects
//! average their test scores, branches take the weight-normalized mean of
//! their children, and the category scores feed the final-score formula in
//! [`score`]. The result tree is built during traversal.
//!
//! Two invocation modes produce identical results: [`grade_from_tree`]
//! consumes a pre-built tree (the batch path), [`grade_from_config`] builds
//! the tree inline for a single submission.

pub mod score;

use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::criteria::{build_tree, CategoryNode, CriteriaTree, NodeBody};
use crate::error::TreeError;
use crate::models::{CriteriaConfig, ResultChild, ResultNode, ResultTree, TestLeaf};
use crate::sandbox::SandboxLease;
use crate::templates::{Template, TestFn as _, TestInvocation, TestServices};

/// Shared references a grading run threads through the traversal.
#[derive(Clone, Copy)]
struct GradeCtx<'a> {
    files: &'a IndexMap<String, String>,
    sandbox: Option<&'a SandboxLease>,
    services: &'a TestServices,
}

/// Grades a submission against a pre-built criteria tree.
pub async fn grade_from_tree(
    tree: &CriteriaTree,
    files: &IndexMap<String, String>,
    sandbox: Option<&SandboxLease>,
    services: &TestServices,
) -> ResultTree {
    let ctx = GradeCtx {
        files,
        sandbox,
        services,
    };

    let base = grade_category("base", tree.base.as_ref(), ctx).await;
    let bonus = grade_category("bonus", tree.bonus.as_ref(), ctx).await;
    let penalty = grade_category("penalty", tree.penalty.as_ref(), ctx).await;

    let final_score = score::final_score(
        base.as_ref().map(|n| n.score),
        bonus.as_ref().map(|n| (n.score, n.weight)),
        penalty.as_ref().map(|n| (n.score, n.weight)),
    );

    ResultTree {
        base,
        bonus,
        penalty,
        final_score,
    }
}

/// Grades a single submission straight from the declarative config,
/// building the tree inline.
///
/// For any `(config, template, submission)`, this produces the same result
/// as [`grade_from_tree`] over [`build_tree`]'s output.
pub async fn grade_from_config(
    config: &CriteriaConfig,
    template: &Template,
    language: Option<&str>,
    files: &IndexMap<String, String>,
    sandbox: Option<&SandboxLease>,
    services: &TestServices,
) -> Result<ResultTree, TreeError> {
    let tree = build_tree(config, template, language)?;
    Ok(grade_from_tree(&tree, files, sandbox, services).await)
}

async fn grade_category(
    name: &str,
    category: Option<&CategoryNode>,
    ctx: GradeCtx<'_>,
) -> Option<ResultNode> {
    let category = category?;

    let (score, children) = match grade_body(&category.body, ctx).await {
        Some((score, children)) => (score, children),
        // A present-but-empty category scores zero, same as a missing one.
        None => (0.0, Vec::new()),
    };

    Some(ResultNode {
        name: name.to_string(),
        weight: category.weight,
        score,
        children,
    })
}

/// Scores a node body. `None` means the subtree has no runnable tests and
/// must be excluded from its parent's weighted mean.
fn grade_body<'a>(
    body: &'a NodeBody,
    ctx: GradeCtx<'a>,
) -> BoxFuture<'a, Option<(f64, Vec<ResultChild>)>> {
    Box::pin(async move {
        match body {
            NodeBody::Tests(tests) => {
                if tests.is_empty() {
                    return None;
                }

                let mut children = Vec::with_capacity(tests.len());
                let mut scores = Vec::with_capacity(tests.len());
                for test in tests {
                    let result = test
                        .func
                        .run(TestInvocation {
                            parameters: &test.parameters,
                            file: test.file.as_deref(),
                            files: ctx.files,
                            sandbox: ctx.sandbox,
                            services: ctx.services,
                        })
                        .await;

                    tracing::debug!(
                        test = %test.name,
                        status = ?result.status,
                        score = result.score,
                        "Test executed"
                    );

                    scores.push(result.score);
                    children.push(ResultChild::Test(TestLeaf::new(
                        test.name.clone(),
                        test.parameters.clone(),
                        result,
                    )));
                }

                score::mean(&scores).map(|score| (score, children))
            }
            NodeBody::Subjects(subjects) => {
                let mut scored: Vec<(f64, f64)> = Vec::new();
                let mut graded: Vec<(usize, f64, Vec<ResultChild>)> = Vec::new();

                for (index, subject) in subjects.iter().enumerate() {
                    if let Some((score, children)) = grade_body(&subject.body, ctx).await {
                        scored.push((score, subject.weight));
                        graded.push((index, score, children));
                    }
                }

                let total = score::weighted_mean(&scored)?;
                let weights: Vec<f64> = scored.iter().map(|(_, w)| *w).collect();
                let normalized = score::normalize_weights(&weights);

                let children = graded
                    .into_iter()
                    .zip(normalized)
                    .map(|((index, score, children), weight)| {
                        ResultChild::Subject(ResultNode {
                            name: subjects[index].name.clone(),
                            weight,
                            score,
                            children,
                        })
                    })
                    .collect();

                Some((total, children))
            }
        }
    })
}
