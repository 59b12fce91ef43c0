//! Typed access to rubric test parameters.

use serde_json::Value;

use crate::models::{ParameterConfig, TestResult};

/// A shape error in a test's parameters, reported at execution time.
#[derive(Debug)]
pub struct ParamError {
    pub parameter: String,
    pub message: String,
}

impl ParamError {
    fn new(parameter: &str, message: impl Into<String>) -> Self {
        Self {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }

    /// Converts the error into a zero-score test result.
    pub fn into_result(self) -> TestResult {
        TestResult::error(format!(
            "Bad parameter '{}': {}",
            self.parameter, self.message
        ))
    }
}

impl std::fmt::Display for ParamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parameter '{}': {}", self.parameter, self.message)
    }
}

/// Read-only view over a test's ordered parameters.
#[derive(Clone, Copy)]
pub struct Params<'a>(&'a [ParameterConfig]);

impl<'a> Params<'a> {
    pub fn new(parameters: &'a [ParameterConfig]) -> Self {
        Self(parameters)
    }

    /// Raw value by name.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Required string parameter.
    pub fn str(&self, name: &str) -> Result<&'a str, ParamError> {
        match self.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(ParamError::new(
                name,
                format!("expected a string, got {other}"),
            )),
            None => Err(ParamError::new(name, "missing")),
        }
    }

    /// Optional string parameter.
    pub fn opt_str(&self, name: &str) -> Result<Option<&'a str>, ParamError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(ParamError::new(
                name,
                format!("expected a string, got {other}"),
            )),
        }
    }

    /// Required non-negative integer parameter.
    pub fn u64(&self, name: &str) -> Result<u64, ParamError> {
        match self.get(name) {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| ParamError::new(name, "expected a non-negative integer")),
            Some(other) => Err(ParamError::new(
                name,
                format!("expected a number, got {other}"),
            )),
            None => Err(ParamError::new(name, "missing")),
        }
    }

    /// Optional numeric parameter, read as a float.
    pub fn opt_f64(&self, name: &str) -> Result<Option<f64>, ParamError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| ParamError::new(name, "expected a number")),
            Some(other) => Err(ParamError::new(
                name,
                format!("expected a number, got {other}"),
            )),
        }
    }

    /// Optional non-negative integer parameter.
    pub fn opt_u64(&self, name: &str) -> Result<Option<u64>, ParamError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(Some)
                .ok_or_else(|| ParamError::new(name, "expected a non-negative integer")),
            Some(other) => Err(ParamError::new(
                name,
                format!("expected a number, got {other}"),
            )),
        }
    }

    /// A parameter that is either a scalar or an array of scalars, read as
    /// lines of text. Numbers and booleans are stringified.
    pub fn lines(&self, name: &str) -> Result<Vec<String>, ParamError> {
        match self.get(name) {
            None => Ok(Vec::new()),
            Some(value) => value_lines(name, value),
        }
    }

    /// Same as [`Params::lines`] but the parameter must be present.
    pub fn required_lines(&self, name: &str) -> Result<Vec<String>, ParamError> {
        match self.get(name) {
            None => Err(ParamError::new(name, "missing")),
            Some(value) => value_lines(name, value),
        }
    }

    /// Required parameter of any JSON shape.
    pub fn value(&self, name: &str) -> Result<&'a Value, ParamError> {
        self.get(name).ok_or_else(|| ParamError::new(name, "missing"))
    }
}

fn value_lines(name: &str, value: &Value) -> Result<Vec<String>, ParamError> {
    match value {
        Value::Array(items) => items.iter().map(|item| scalar_string(name, item)).collect(),
        scalar => Ok(vec![scalar_string(name, scalar)?]),
    }
}

fn scalar_string(name: &str, value: &Value) -> Result<String, ParamError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ParamError::new(
            name,
            format!("expected a scalar, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(values: &[(&str, Value)]) -> Vec<ParameterConfig> {
        values
            .iter()
            .map(|(name, value)| ParameterConfig::new(*name, value.clone()))
            .collect()
    }

    #[test]
    fn typed_accessors() {
        let list = params(&[
            ("tag", json!("article")),
            ("required_count", json!(4)),
            ("inputs", json!(["5", 3, true])),
        ]);
        let p = Params::new(&list);

        assert_eq!(p.str("tag").unwrap(), "article");
        assert_eq!(p.u64("required_count").unwrap(), 4);
        assert_eq!(
            p.lines("inputs").unwrap(),
            vec!["5".to_string(), "3".to_string(), "true".to_string()]
        );
        assert_eq!(p.opt_str("missing").unwrap(), None);
        assert!(p.lines("missing").unwrap().is_empty());
    }

    #[test]
    fn wrong_types_are_reported() {
        let list = params(&[("tag", json!(7))]);
        let p = Params::new(&list);

        let err = p.str("tag").unwrap_err();
        assert!(err.message.contains("expected a string"));

        let result = err.into_result();
        assert!(result.report.contains("tag"));
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn scalar_expected_output_becomes_one_line() {
        let list = params(&[("expected_output", json!("8"))]);
        let p = Params::new(&list);
        assert_eq!(p.required_lines("expected_output").unwrap(), vec!["8"]);
    }

    #[test]
    fn opt_f64_accepts_integers_and_floats() {
        let list = params(&[("max_score", json!(60)), ("ratio", json!(0.5))]);
        let p = Params::new(&list);

        assert_eq!(p.opt_f64("max_score").unwrap(), Some(60.0));
        assert_eq!(p.opt_f64("ratio").unwrap(), Some(0.5));
        assert_eq!(p.opt_f64("absent").unwrap(), None);

        let bad = params(&[("max_score", json!("high"))]);
        assert!(Params::new(&bad).opt_f64("max_score").is_err());
    }
}
