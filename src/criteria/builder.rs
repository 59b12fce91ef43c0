//! Builds a typed [`CriteriaTree`] from the declarative rubric document.
//!
//! Building validates everything that can be validated before execution:
//! the subjects-xor-tests invariant, positive weights, test-name resolution
//! against the template, required parameters, and `program_command`
//! language resolution. Parameter values are otherwise passed through
//! verbatim; nothing is evaluated here.

use serde_json::Value;

use crate::error::TreeError;
use crate::models::{CategoryConfig, CriteriaConfig, SubjectConfig, TestConfig};
use crate::templates::{Template, TestFn as _};

use super::tree::{CategoryNode, CriteriaTree, NodeBody, Subject, TestSpec};

/// Builds and validates the criteria tree for one submission language.
pub fn build_tree(
    config: &CriteriaConfig,
    template: &Template,
    language: Option<&str>,
) -> Result<CriteriaTree, TreeError> {
    Ok(CriteriaTree {
        template: template.name().to_string(),
        base: config
            .base
            .as_ref()
            .map(|c| build_category("base", c, template, language))
            .transpose()?,
        bonus: config
            .bonus
            .as_ref()
            .map(|c| build_category("bonus", c, template, language))
            .transpose()?,
        penalty: config
            .penalty
            .as_ref()
            .map(|c| build_category("penalty", c, template, language))
            .transpose()?,
    })
}

fn build_category(
    name: &str,
    category: &CategoryConfig,
    template: &Template,
    language: Option<&str>,
) -> Result<CategoryNode, TreeError> {
    if category.weight < 0.0 {
        return Err(TreeError::NonPositiveWeight {
            subject: name.to_string(),
            weight: category.weight,
        });
    }

    Ok(CategoryNode {
        weight: category.weight,
        body: build_body(
            name,
            &category.subjects,
            &category.tests,
            template,
            language,
        )?,
    })
}

fn build_body(
    owner: &str,
    subjects: &[SubjectConfig],
    tests: &[TestConfig],
    template: &Template,
    language: Option<&str>,
) -> Result<NodeBody, TreeError> {
    match (subjects.is_empty(), tests.is_empty()) {
        (false, false) => Err(TreeError::MixedChildren {
            subject: owner.to_string(),
        }),
        (false, true) => Ok(NodeBody::Subjects(
            subjects
                .iter()
                .map(|s| build_subject(s, template, language))
                .collect::<Result<_, _>>()?,
        )),
        // An empty node is representable and silently excluded from
        // aggregation; only mixing is malformed.
        (true, _) => Ok(NodeBody::Tests(
            tests
                .iter()
                .map(|t| build_test(t, template, language))
                .collect::<Result<_, _>>()?,
        )),
    }
}

fn build_subject(
    subject: &SubjectConfig,
    template: &Template,
    language: Option<&str>,
) -> Result<Subject, TreeError> {
    if subject.weight <= 0.0 {
        return Err(TreeError::NonPositiveWeight {
            subject: subject.subject_name.clone(),
            weight: subject.weight,
        });
    }

    Ok(Subject {
        name: subject.subject_name.clone(),
        weight: subject.weight,
        body: build_body(
            &subject.subject_name,
            &subject.subjects,
            &subject.tests,
            template,
            language,
        )?,
    })
}

fn build_test(
    test: &TestConfig,
    template: &Template,
    language: Option<&str>,
) -> Result<TestSpec, TreeError> {
    let func = template
        .resolve(&test.name)
        .ok_or_else(|| TreeError::UnknownTest {
            test: test.name.clone(),
            template: template.name().to_string(),
        })?;

    for required in func.required_parameters() {
        if !test.parameters.iter().any(|p| p.name == *required) {
            return Err(TreeError::MissingParameter {
                test: test.name.clone(),
                parameter: (*required).to_string(),
            });
        }
    }

    // Resolve multi-language command maps to a concrete string now, so test
    // functions stay language-agnostic.
    let parameters = test
        .parameters
        .iter()
        .map(|p| {
            if p.name == "program_command" {
                let resolved = resolve_program_command(&test.name, &p.value, language)?;
                Ok(crate::models::ParameterConfig::new(
                    p.name.clone(),
                    Value::String(resolved),
                ))
            } else {
                Ok(p.clone())
            }
        })
        .collect::<Result<Vec<_>, TreeError>>()?;

    Ok(TestSpec {
        name: test.name.clone(),
        file: test.file.clone(),
        parameters,
        func,
    })
}

fn resolve_program_command(
    test: &str,
    value: &Value,
    language: Option<&str>,
) -> Result<String, TreeError> {
    match value {
        Value::String(command) => Ok(command.clone()),
        Value::Object(map) => {
            let language = language.ok_or_else(|| TreeError::MissingLanguageCommand {
                test: test.to_string(),
                language: "<unspecified>".to_string(),
            })?;
            match map.get(language) {
                Some(Value::String(command)) => Ok(command.clone()),
                Some(other) => Err(TreeError::BadParameter {
                    test: test.to_string(),
                    parameter: "program_command".to_string(),
                    message: format!("command for '{language}' must be a string, got {other}"),
                }),
                None => Err(TreeError::MissingLanguageCommand {
                    test: test.to_string(),
                    language: language.to_string(),
                }),
            }
        }
        other => Err(TreeError::BadParameter {
            test: test.to_string(),
            parameter: "program_command".to_string(),
            message: format!("expected a string or language map, got {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateRegistry;
    use serde_json::json;

    fn webdev() -> std::sync::Arc<Template> {
        TemplateRegistry::builtin().get("webdev").unwrap()
    }

    fn io_template() -> std::sync::Arc<Template> {
        TemplateRegistry::builtin().get("input_output").unwrap()
    }

    fn config(doc: serde_json::Value) -> CriteriaConfig {
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn builds_nested_subjects_in_order() {
        let config = config(json!({
            "base": {
                "weight": 100,
                "subjects": [
                    {
                        "subject_name": "structure",
                        "weight": 60,
                        "tests": [
                            {"name": "has_tag", "parameters": [{"name": "tag", "value": "main"}]},
                            {"name": "has_tag", "parameters": [{"name": "tag", "value": "nav"}]}
                        ]
                    },
                    {
                        "subject_name": "style",
                        "weight": 40,
                        "tests": [
                            {"name": "has_style", "parameters": [{"name": "property", "value": "display"}]}
                        ]
                    }
                ]
            }
        }));

        let tree = build_tree(&config, &webdev(), None).unwrap();
        let base = tree.base.unwrap();
        let NodeBody::Subjects(subjects) = &base.body else {
            panic!("expected subjects");
        };
        assert_eq!(subjects[0].name, "structure");
        assert_eq!(subjects[1].name, "style");
        let NodeBody::Tests(tests) = &subjects[0].body else {
            panic!("expected tests");
        };
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].parameters[0].value, json!("main"));
    }

    #[test]
    fn unknown_test_names_both_sides() {
        let config = config(json!({
            "base": {
                "weight": 100,
                "tests": [{"name": "expect_output", "parameters": []}]
            }
        }));

        let err = build_tree(&config, &webdev(), None).unwrap_err();
        match err {
            TreeError::UnknownTest { test, template } => {
                assert_eq!(test, "expect_output");
                assert_eq!(template, "webdev");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mixed_children_are_rejected() {
        let config = config(json!({
            "base": {
                "weight": 100,
                "subjects": [{
                    "subject_name": "broken",
                    "weight": 50,
                    "subjects": [{
                        "subject_name": "inner",
                        "weight": 100,
                        "tests": [{"name": "has_tag", "parameters": [{"name": "tag", "value": "p"}]}]
                    }],
                    "tests": [{"name": "has_tag", "parameters": [{"name": "tag", "value": "p"}]}]
                }]
            }
        }));

        let err = build_tree(&config, &webdev(), None).unwrap_err();
        assert!(matches!(err, TreeError::MixedChildren { subject } if subject == "broken"));
    }

    #[test]
    fn non_positive_subject_weight_is_rejected() {
        let config = config(json!({
            "base": {
                "weight": 100,
                "subjects": [{"subject_name": "zero", "weight": 0, "tests": []}]
            }
        }));

        let err = build_tree(&config, &webdev(), None).unwrap_err();
        assert!(matches!(err, TreeError::NonPositiveWeight { .. }));
    }

    #[test]
    fn missing_required_parameter_fails_at_build() {
        let config = config(json!({
            "base": {
                "weight": 100,
                "tests": [{"name": "expect_output", "parameters": [
                    {"name": "expected_output", "value": "8"}
                ]}]
            }
        }));

        let err = build_tree(&config, &io_template(), None).unwrap_err();
        assert!(matches!(
            err,
            TreeError::MissingParameter { parameter, .. } if parameter == "program_command"
        ));
    }

    #[test]
    fn program_command_map_resolves_by_language() {
        let config = config(json!({
            "base": {
                "weight": 100,
                "tests": [{"name": "expect_output", "parameters": [
                    {"name": "expected_output", "value": "8"},
                    {"name": "program_command", "value": {
                        "python": "python3 calc.py",
                        "java": "java Calculator"
                    }}
                ]}]
            }
        }));

        let tree = build_tree(&config, &io_template(), Some("java")).unwrap();
        let NodeBody::Tests(tests) = &tree.base.unwrap().body else {
            panic!("expected tests");
        };
        let command = tests[0]
            .parameters
            .iter()
            .find(|p| p.name == "program_command")
            .unwrap();
        assert_eq!(command.value, json!("java Calculator"));

        let err = build_tree(&config, &io_template(), Some("rust")).unwrap_err();
        assert!(matches!(
            err,
            TreeError::MissingLanguageCommand { language, .. } if language == "rust"
        ));
    }

    #[test]
    fn tree_round_trips_to_an_equivalent_config() {
        let original = config(json!({
            "test_library": "webdev",
            "base": {
                "weight": 100.0,
                "subjects": [
                    {
                        "subject_name": "structure",
                        "weight": 30.0,
                        "tests": [{"name": "has_tag", "parameters": [{"name": "tag", "value": "main"}]}]
                    },
                    {
                        "subject_name": "accessibility",
                        "weight": 70.0,
                        "tests": [{"name": "has_attribute", "parameters": [{"name": "attribute", "value": "alt"}]}]
                    }
                ]
            },
            "bonus": {
                "weight": 40.0,
                "tests": [{"name": "check_bootstrap_usage", "parameters": []}]
            }
        }));

        let tree = build_tree(&original, &webdev(), None).unwrap();
        let back = tree.to_config();
        assert_eq!(back, original);
    }

    #[test]
    fn empty_category_is_allowed() {
        let config = config(json!({
            "base": {"weight": 100, "tests": []}
        }));
        let tree = build_tree(&config, &webdev(), None).unwrap();
        assert!(tree.base.unwrap().body.is_empty());
    }
}
