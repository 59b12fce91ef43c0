//! Test libraries: named registries of test functions per assignment family.
//!
//! A template maps test-function names to implementations with the uniform
//! signature `(parameters, files, sandbox?) -> TestResult`. Four templates
//! ship built in:
//!
//! - `webdev` — static HTML/CSS analysis, no sandbox
//! - `input_output` — run the program, compare stdout, sandbox required
//! - `api` — start the student server, probe it over HTTP, sandbox required
//! - `essay` — AI-graded criteria, no sandbox
//!
//! The registry is populated once at startup and immutable afterwards.

pub mod api;
pub mod essay;
pub mod input_output;
pub mod params;
pub mod webdev;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use indexmap::IndexMap;

use crate::feedback::ChatProvider;
use crate::models::{ParameterConfig, TestResult};
use crate::sandbox::SandboxLease;

pub use params::Params;

/// Shared clients test functions may use.
#[derive(Clone)]
pub struct TestServices {
    /// HTTP client for api-template probes.
    pub http: reqwest::Client,
    /// Chat provider for essay grading, when configured.
    pub ai: Option<Arc<dyn ChatProvider>>,
    /// Default deadline for sandbox commands issued by tests.
    pub test_deadline: Duration,
}

impl TestServices {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            ai: None,
            test_deadline: Duration::from_secs(30),
        }
    }

    pub fn with_ai(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.ai = Some(provider);
        self
    }

    pub fn with_test_deadline(mut self, deadline: Duration) -> Self {
        self.test_deadline = deadline;
        self
    }
}

impl Default for TestServices {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one test execution can see.
pub struct TestInvocation<'a> {
    /// Ordered named parameters from the rubric, verbatim.
    pub parameters: &'a [ParameterConfig],
    /// Optional target file declared on the rubric leaf.
    pub file: Option<&'a str>,
    /// The submission's files.
    pub files: &'a IndexMap<String, String>,
    /// Sandbox lease, present for templates that declared the need.
    pub sandbox: Option<&'a SandboxLease>,
    pub services: &'a TestServices,
}

pub type TestFuture<'a> = BoxFuture<'a, TestResult>;

/// A registered test function.
///
/// Implementations assert their parameter shape at the boundary; the
/// builder checks [`TestFn::required_parameters`] up front so malformed
/// rubrics fail before any sandbox is acquired.
pub trait TestFn: Send + Sync {
    /// Parameter names that must be present in the rubric.
    fn required_parameters(&self) -> &'static [&'static str] {
        &[]
    }

    fn run<'a>(&'a self, invocation: TestInvocation<'a>) -> TestFuture<'a>;
}

/// A named test library.
pub struct Template {
    name: String,
    requires_sandbox: bool,
    tests: HashMap<String, Arc<dyn TestFn>>,
}

impl Template {
    pub fn new(name: impl Into<String>, requires_sandbox: bool) -> Self {
        Self {
            name: name.into(),
            requires_sandbox,
            tests: HashMap::new(),
        }
    }

    /// Registers a test function under a name.
    pub fn register(mut self, name: impl Into<String>, test: Arc<dyn TestFn>) -> Self {
        self.tests.insert(name.into(), test);
        self
    }

    /// Looks a test function up by name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn TestFn>> {
        self.tests.get(name).cloned()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether grading against this template needs a sandbox acquired in
    /// pre-flight.
    pub fn requires_sandbox(&self) -> bool {
        self.requires_sandbox
    }

    /// Registered test names, sorted for stable error messages.
    pub fn test_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tests.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// The process-wide, read-only template registry.
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<Template>>,
}

impl TemplateRegistry {
    /// Builds the registry of built-in templates.
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        for template in [
            webdev::template(),
            input_output::template(),
            api::template(),
            essay::template(),
        ] {
            templates.insert(template.name().to_string(), Arc::new(template));
        }
        Self { templates }
    }

    /// An empty registry, for tests that register their own templates.
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Adds a template, replacing any previous registration of the name.
    pub fn insert(&mut self, template: Template) {
        self.templates
            .insert(template.name().to_string(), Arc::new(template));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.get(name).cloned()
    }

    /// Registered template names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_all_four_templates() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["api", "essay", "input_output", "webdev"]
        );
    }

    #[test]
    fn sandbox_requirements_follow_the_family() {
        let registry = TemplateRegistry::builtin();
        assert!(!registry.get("webdev").unwrap().requires_sandbox());
        assert!(!registry.get("essay").unwrap().requires_sandbox());
        assert!(registry.get("input_output").unwrap().requires_sandbox());
        assert!(registry.get("api").unwrap().requires_sandbox());
    }

    #[test]
    fn resolve_unknown_test_is_none() {
        let registry = TemplateRegistry::builtin();
        let webdev = registry.get("webdev").unwrap();
        assert!(webdev.resolve("has_tag").is_some());
        assert!(webdev.resolve("expect_output").is_none());
    }
}
