//! Grading configuration: the rubric bound to an assignment.
//!
//! The declarative documents ([`CriteriaConfig`], [`SetupConfig`]) are stable,
//! JSON-serializable schemas. They are parsed into the typed criteria tree at
//! pipeline time; nothing here is evaluated at rest.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A rubric registered for an assignment, versioned and activatable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingConfig {
    /// Internal identifier.
    pub id: Uuid,
    /// External assignment identifier this rubric is bound to.
    pub assignment_id: String,
    /// Name of the test library the rubric draws from.
    pub template_name: String,
    /// Languages the assignment accepts. Empty means single-language.
    #[serde(default)]
    pub languages: Vec<String>,
    /// The declarative rubric.
    pub criteria: CriteriaConfig,
    /// Required files and setup commands, single- or per-language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupConfig>,
    /// Feedback generation settings for this assignment.
    #[serde(default)]
    pub feedback: FeedbackSettings,
    pub version: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GradingConfig {
    /// Creates a new active version-1 config.
    pub fn new(
        assignment_id: impl Into<String>,
        template_name: impl Into<String>,
        criteria: CriteriaConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            assignment_id: assignment_id.into(),
            template_name: template_name.into(),
            languages: Vec::new(),
            criteria,
            setup: None,
            feedback: FeedbackSettings::default(),
            version: 1,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the supported languages.
    pub fn with_languages(mut self, languages: Vec<String>) -> Self {
        self.languages = languages;
        self
    }

    /// Sets the setup config.
    pub fn with_setup(mut self, setup: SetupConfig) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Sets the feedback settings.
    pub fn with_feedback(mut self, feedback: FeedbackSettings) -> Self {
        self.feedback = feedback;
        self
    }

    /// The template the rubric resolves against: the rubric-level
    /// `test_library` override when present, else the config's template.
    pub fn effective_template(&self) -> &str {
        self.criteria
            .test_library
            .as_deref()
            .unwrap_or(&self.template_name)
    }
}

/// How feedback is produced for a graded submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSettings {
    /// Whether the focus and feedback steps run at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Which producer turns the result tree into prose.
    #[serde(default)]
    pub mode: FeedbackMode,
    /// Optional webhook the final result is exported to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: FeedbackMode::Default,
            export_url: None,
        }
    }
}

/// Feedback producer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackMode {
    /// Deterministic report formatter.
    #[default]
    Default,
    /// AI-assisted prose via the configured model endpoint.
    Ai,
}

/// The declarative rubric document.
///
/// Root categories are all optional; a missing `bonus` or `penalty` is
/// equivalent to declaring it with weight 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CriteriaConfig {
    /// Overrides the config-level template name when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_library: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<CategoryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonus: Option<CategoryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty: Option<CategoryConfig>,
}

/// A category root: a weight (absolute point cap for bonus/penalty) plus
/// either subjects or tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<SubjectConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestConfig>,
}

/// A named, weighted rubric node containing either subjects or tests —
/// never both. The exclusivity is enforced at tree-build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectConfig {
    pub subject_name: String,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<SubjectConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestConfig>,
}

/// A rubric leaf: a test-function name plus ordered named parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterConfig>,
}

/// A `(name, value)` test parameter. Order is preserved so tests can be
/// invoked positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    pub name: String,
    pub value: Value,
}

impl ParameterConfig {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Setup configuration, single-language or keyed per language tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SetupConfig {
    Single(SetupSpec),
    PerLanguage(IndexMap<String, SetupSpec>),
}

impl SetupConfig {
    /// Resolves the effective spec for a submission language.
    ///
    /// The single-language form applies regardless of the tag; the
    /// per-language form requires a matching key.
    pub fn for_language(&self, language: Option<&str>) -> Option<&SetupSpec> {
        match self {
            SetupConfig::Single(spec) => Some(spec),
            SetupConfig::PerLanguage(map) => language.and_then(|lang| map.get(lang)),
        }
    }
}

/// Required files, setup commands, and sandbox hints for one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SetupSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_commands: Vec<SetupCommand>,
    /// Overrides the pool's image for this assignment, when supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_image: Option<String>,
    /// Container port the student server listens on (api template).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
}

/// A setup command, plain or named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SetupCommand {
    Plain(String),
    Named { name: String, command: String },
}

impl SetupCommand {
    /// Display name for step records and error messages.
    pub fn name(&self) -> &str {
        match self {
            SetupCommand::Plain(cmd) => cmd,
            SetupCommand::Named { name, .. } => name,
        }
    }

    /// The shell command to execute.
    pub fn command(&self) -> &str {
        match self {
            SetupCommand::Plain(cmd) => cmd,
            SetupCommand::Named { command, .. } => command,
        }
    }
}
