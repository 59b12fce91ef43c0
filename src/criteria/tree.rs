//! The typed, resolved form of a rubric.
//!
//! The `tests XOR subjects` invariant is carried in the type: a node body is
//! either a list of subjects or a list of tests, never both. Every test
//! holds its resolved function, so grading never performs name lookups.

use std::sync::Arc;

use crate::models::{
    CategoryConfig, CriteriaConfig, ParameterConfig, SubjectConfig, TestConfig,
};
use crate::templates::TestFn;

/// A resolved rubric leaf, function pointer attached.
#[derive(Clone)]
pub struct TestSpec {
    pub name: String,
    pub file: Option<String>,
    /// Ordered parameters, `program_command` already resolved to a string.
    pub parameters: Vec<ParameterConfig>,
    pub func: Arc<dyn TestFn>,
}

impl std::fmt::Debug for TestSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSpec")
            .field("name", &self.name)
            .field("file", &self.file)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Children of a rubric node: further subjects or tests, exclusively.
#[derive(Debug, Clone)]
pub enum NodeBody {
    Subjects(Vec<Subject>),
    Tests(Vec<TestSpec>),
}

impl NodeBody {
    /// Whether the subtree contains no tests at all.
    pub fn is_empty(&self) -> bool {
        match self {
            NodeBody::Tests(tests) => tests.is_empty(),
            NodeBody::Subjects(subjects) => subjects.iter().all(|s| s.body.is_empty()),
        }
    }
}

/// A named, weighted rubric node.
#[derive(Debug, Clone)]
pub struct Subject {
    pub name: String,
    pub weight: f64,
    pub body: NodeBody,
}

/// A category root: `base`, `bonus`, or `penalty`.
///
/// The weight is the category's absolute point cap (bonus/penalty) or the
/// base scale.
#[derive(Debug, Clone)]
pub struct CategoryNode {
    pub weight: f64,
    pub body: NodeBody,
}

/// A fully resolved rubric, safe to share across submissions.
#[derive(Debug, Clone)]
pub struct CriteriaTree {
    /// Name of the template the tests were resolved against.
    pub template: String,
    pub base: Option<CategoryNode>,
    pub bonus: Option<CategoryNode>,
    pub penalty: Option<CategoryNode>,
}

impl CriteriaTree {
    /// Serializes the tree back into the declarative document form.
    ///
    /// Weights and sibling order come back verbatim; the only change a
    /// build applies is `program_command` language resolution.
    pub fn to_config(&self) -> CriteriaConfig {
        CriteriaConfig {
            test_library: Some(self.template.clone()),
            base: self.base.as_ref().map(category_config),
            bonus: self.bonus.as_ref().map(category_config),
            penalty: self.penalty.as_ref().map(category_config),
        }
    }
}

fn category_config(category: &CategoryNode) -> CategoryConfig {
    let (subjects, tests) = body_config(&category.body);
    CategoryConfig {
        weight: category.weight,
        subjects,
        tests,
    }
}

fn body_config(body: &NodeBody) -> (Vec<SubjectConfig>, Vec<TestConfig>) {
    match body {
        NodeBody::Subjects(subjects) => (
            subjects
                .iter()
                .map(|s| {
                    let (subjects, tests) = body_config(&s.body);
                    SubjectConfig {
                        subject_name: s.name.clone(),
                        weight: s.weight,
                        subjects,
                        tests,
                    }
                })
                .collect(),
            Vec::new(),
        ),
        NodeBody::Tests(tests) => (
            Vec::new(),
            tests
                .iter()
                .map(|t| TestConfig {
                    name: t.name.clone(),
                    file: t.file.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        ),
    }
}
