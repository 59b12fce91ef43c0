//! Input/output tests: run the student program with piped stdin and compare
//! its stdout against the expected output. Requires a sandbox.

use std::sync::Arc;

use crate::models::{Telemetry, TestResult};
use crate::sandbox::RunOptions;

use super::params::Params;
use super::{Template, TestFn, TestFuture, TestInvocation};

/// Builds the `input_output` template.
pub fn template() -> Template {
    Template::new("input_output", true).register("expect_output", Arc::new(ExpectOutput))
}

/// `expect_output(inputs, expected_output, program_command)`.
///
/// Inputs are joined with newlines and piped on stdin. Stdout is compared
/// line by line with surrounding whitespace trimmed and trailing blank lines
/// ignored; the comparison is binary (exact match or not).
struct ExpectOutput;

impl TestFn for ExpectOutput {
    fn required_parameters(&self) -> &'static [&'static str] {
        &["expected_output", "program_command"]
    }

    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let params = Params::new(inv.parameters);

            let command = match params.str("program_command") {
                Ok(cmd) => cmd.to_string(),
                Err(e) => return e.into_result(),
            };
            let inputs = match params.lines("inputs") {
                Ok(lines) => lines,
                Err(e) => return e.into_result(),
            };
            let expected = match params.required_lines("expected_output") {
                Ok(lines) => lines,
                Err(e) => return e.into_result(),
            };

            let Some(sandbox) = inv.sandbox else {
                return TestResult::error("expect_output requires a sandbox environment");
            };

            let mut opts = RunOptions::default().with_deadline(inv.services.test_deadline);
            if !inputs.is_empty() {
                opts = opts.with_stdin(format!("{}\n", inputs.join("\n")));
            }

            let output = match sandbox.run(&command, &opts).await {
                Ok(output) => output,
                Err(crate::error::SandboxError::ExecTimeout { seconds }) => {
                    return TestResult::error(format!(
                        "Program did not finish within {seconds} seconds"
                    ));
                }
                Err(e) => {
                    return TestResult::error(format!("Program could not be executed: {e}"));
                }
            };

            let telemetry = Telemetry {
                stdout: output.stdout.clone(),
                stderr: output.stderr.clone(),
                exit_code: output.exit_code,
            };

            let actual = normalized_lines(&output.stdout);
            let wanted: Vec<&str> = expected.iter().map(|l| l.trim()).collect();

            if actual == wanted {
                TestResult::pass("Output matched the expected result")
                    .with_telemetry(telemetry)
            } else {
                let mut report = format!(
                    "Expected output:\n{}\n\nActual output:\n{}",
                    wanted.join("\n"),
                    actual.join("\n"),
                );
                if !output.success() {
                    report.push_str(&format!(
                        "\n\nProgram exited with code {}",
                        output.exit_code
                    ));
                }
                TestResult::fail(report).with_telemetry(telemetry)
            }
        })
    }
}

/// Trims each line and drops trailing blank lines.
fn normalized_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.lines().map(str::trim).collect();
    while lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}
