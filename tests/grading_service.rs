//! End-to-end grading scenarios over the in-memory repository and the fake
//! sandbox backend.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use gradeforge::coordinator::{Coordinator, CoordinatorConfig, SubmissionView};
use gradeforge::error::ErrorKind;
use gradeforge::feedback::ReportFormatter;
use gradeforge::models::{
    GradingConfig, PipelineStatus, SetupConfig, StepStatus, SubmissionFile, SubmissionRequest,
    SubmissionStatus, TestStatus,
};
use gradeforge::sandbox::{
    ExecOutput, FakeBackend, LanguagePoolConfig, PoolConfig, SandboxBackend, SandboxPool,
};
use gradeforge::storage::{MemoryRepository, Repository};
use gradeforge::templates::{TemplateRegistry, TestServices};

struct Harness {
    repository: Arc<MemoryRepository>,
    coordinator: Coordinator,
    backend: Arc<FakeBackend>,
    pool: SandboxPool,
}

fn harness(language: &str, backend: FakeBackend) -> Harness {
    let repository = Arc::new(MemoryRepository::new());
    let backend = Arc::new(backend);
    let pool = SandboxPool::new(
        PoolConfig::single(language, LanguagePoolConfig::new("python:3.11-slim", 1)),
        Arc::clone(&backend) as Arc<dyn SandboxBackend>,
    );

    let coordinator = Coordinator::new(
        Arc::clone(&repository) as Arc<dyn Repository>,
        Arc::new(TemplateRegistry::builtin()),
        Some(pool.clone()),
        TestServices::new(),
        Arc::new(ReportFormatter::new().unwrap()),
        CoordinatorConfig::default(),
    );

    Harness {
        repository,
        coordinator,
        backend,
        pool,
    }
}

async fn wait_terminal(coordinator: &Coordinator, id: Uuid) -> SubmissionView {
    for _ in 0..250 {
        let view = coordinator.poll(id).await.unwrap();
        if view.submission.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("submission {id} never reached a terminal state");
}

fn io_config(assignment: &str) -> GradingConfig {
    let criteria = serde_json::from_value(json!({
        "base": {
            "weight": 100,
            "tests": [{
                "name": "expect_output",
                "parameters": [
                    {"name": "inputs", "value": ["5", "3"]},
                    {"name": "expected_output", "value": "8"},
                    {"name": "program_command", "value": "python3 calc.py"}
                ]
            }]
        }
    }))
    .unwrap();

    let setup: SetupConfig = serde_json::from_value(json!({
        "required_files": ["calc.py"]
    }))
    .unwrap();

    GradingConfig::new(assignment, "input_output", criteria)
        .with_languages(vec!["python".to_string()])
        .with_setup(setup)
}

fn python_submission(assignment: &str) -> SubmissionRequest {
    SubmissionRequest {
        assignment_id: assignment.to_string(),
        user_id: "u1".to_string(),
        username: "ada".to_string(),
        language: Some("python".to_string()),
        files: vec![SubmissionFile::new(
            "calc.py",
            "print(int(input())+int(input()))",
        )],
    }
}

#[tokio::test]
async fn io_submission_full_pass() {
    let h = harness(
        "python",
        FakeBackend::new().with_response("python3 calc.py", ExecOutput::new(0, "8\n", "")),
    );
    h.pool.initialize().await.unwrap();
    h.repository.create_config(io_config("a1")).await.unwrap();

    let id = h.coordinator.submit(python_submission("a1")).await.unwrap();
    let view = wait_terminal(&h.coordinator, id).await;

    assert_eq!(view.submission.status, SubmissionStatus::Completed);
    let result = view.result.unwrap();
    assert_eq!(result.final_score, 100.0);

    // One leaf, full marks, stdout captured.
    let tree = result.result_tree.as_ref().unwrap();
    let base = tree.base.as_ref().unwrap();
    assert_eq!(base.children.len(), 1);
    match &base.children[0] {
        gradeforge::models::ResultChild::Test(leaf) => {
            assert_eq!(leaf.status, TestStatus::Pass);
            assert_eq!(leaf.score, 100.0);
            assert_eq!(leaf.telemetry.as_ref().unwrap().stdout, "8\n");
        }
        other => panic!("expected a test leaf, got {other:?}"),
    }

    // Every planned step ran (or was legitimately skipped).
    let execution = &result.execution;
    assert_eq!(execution.status, PipelineStatus::Success);
    assert_eq!(execution.total_steps, 8);
    assert_eq!(execution.steps_completed, 8);
    assert!(execution
        .steps
        .iter()
        .all(|s| matches!(s.status, StepStatus::Success | StepStatus::Skipped)));

    // The submission's files were staged into the sandbox before grading.
    let commands = h.backend.commands();
    assert!(commands.iter().any(|c| c.contains("python3 calc.py")));

    // No sandbox leaked.
    assert_eq!(h.pool.leased_count(), 0);
    assert_eq!(h.pool.idle_count().await, 1);
}

#[tokio::test]
async fn missing_required_file_fails_preflight() {
    let h = harness("python", FakeBackend::new());
    h.pool.initialize().await.unwrap();
    h.repository.create_config(io_config("a1")).await.unwrap();

    let mut request = python_submission("a1");
    request.files = vec![SubmissionFile::new("main.py", "print(8)")];

    let id = h.coordinator.submit(request).await.unwrap();
    let view = wait_terminal(&h.coordinator, id).await;

    assert_eq!(view.submission.status, SubmissionStatus::Failed);
    let result = view.result.unwrap();
    assert_eq!(result.final_score, 0.0);
    assert!(result.result_tree.is_none());

    let execution = &result.execution;
    assert_eq!(execution.failed_at_step.as_deref(), Some("PRE_FLIGHT"));
    let error = execution.first_error().unwrap();
    assert_eq!(error.kind, ErrorKind::PreflightMissingFile);

    // The failure prose names the missing file.
    assert!(result.feedback.unwrap().contains("calc.py"));

    // Steps after the failure never ran.
    let grade_step = execution.steps.iter().find(|s| s.name == "GRADE").unwrap();
    assert_eq!(grade_step.status, StepStatus::NotRun);

    // No sandbox leaked on the failure path either: the preflight failed
    // before acquisition, so the pool is untouched.
    assert_eq!(h.pool.leased_count(), 0);
    assert_eq!(h.pool.idle_count().await, 1);
}

#[tokio::test]
async fn setup_command_failure_reports_compiler_output() {
    let backend = FakeBackend::new().with_response(
        "javac",
        ExecOutput::new(1, "", "Calculator.java:3: error: ';' expected"),
    );
    let h = harness("java", backend);
    h.pool.initialize().await.unwrap();

    let criteria = serde_json::from_value(json!({
        "base": {
            "weight": 100,
            "tests": [{
                "name": "expect_output",
                "parameters": [
                    {"name": "inputs", "value": ["5", "3"]},
                    {"name": "expected_output", "value": "8"},
                    {"name": "program_command", "value": {
                        "python": "python3 calc.py",
                        "java": "java Calculator"
                    }}
                ]
            }]
        }
    }))
    .unwrap();
    let setup: SetupConfig = serde_json::from_value(json!({
        "java": {
            "required_files": ["Calculator.java"],
            "setup_commands": [{"name": "compile", "command": "javac Calculator.java"}]
        },
        "python": { "required_files": ["calc.py"] }
    }))
    .unwrap();
    let config = GradingConfig::new("a2", "input_output", criteria)
        .with_languages(vec!["python".to_string(), "java".to_string()])
        .with_setup(setup);
    h.repository.create_config(config).await.unwrap();

    let request = SubmissionRequest {
        assignment_id: "a2".to_string(),
        user_id: "u2".to_string(),
        username: "grace".to_string(),
        language: Some("java".to_string()),
        files: vec![SubmissionFile::new(
            "Calculator.java",
            "class Calculator { int x = }",
        )],
    };

    let id = h.coordinator.submit(request).await.unwrap();
    let view = wait_terminal(&h.coordinator, id).await;

    assert_eq!(view.submission.status, SubmissionStatus::Failed);
    let result = view.result.unwrap();

    let execution = &result.execution;
    assert_eq!(execution.failed_at_step.as_deref(), Some("PRE_FLIGHT"));
    let error = execution.first_error().unwrap();
    assert_eq!(error.kind, ErrorKind::PreflightSetupFailed);

    // Exit code and stderr are recorded structurally and surfaced in prose.
    let details = error.details.as_ref().unwrap();
    assert_eq!(details["exit_code"], json!(1));
    assert!(details["stderr"].as_str().unwrap().contains("';' expected"));
    assert!(result.feedback.unwrap().contains("';' expected"));

    // The sandbox acquired for setup was returned.
    assert_eq!(h.pool.leased_count(), 0);
    assert_eq!(h.pool.idle_count().await, 1);
}

#[tokio::test]
async fn partial_html_match_scores_proportionally() {
    let repository = Arc::new(MemoryRepository::new());
    let coordinator = Coordinator::new(
        Arc::clone(&repository) as Arc<dyn Repository>,
        Arc::new(TemplateRegistry::builtin()),
        None,
        TestServices::new(),
        Arc::new(ReportFormatter::new().unwrap()),
        CoordinatorConfig::default(),
    );

    let criteria = serde_json::from_value(json!({
        "base": {
            "weight": 100,
            "tests": [{
                "name": "has_tag",
                "parameters": [
                    {"name": "tag", "value": "article"},
                    {"name": "required_count", "value": 4}
                ]
            }]
        }
    }))
    .unwrap();
    repository
        .create_config(GradingConfig::new("web1", "webdev", criteria))
        .await
        .unwrap();

    let request = SubmissionRequest {
        assignment_id: "web1".to_string(),
        user_id: "u3".to_string(),
        username: "lin".to_string(),
        language: None,
        files: vec![SubmissionFile::new(
            "index.html",
            "<html><body><article>1</article><article>2</article></body></html>",
        )],
    };

    let id = coordinator.submit(request).await.unwrap();
    let view = wait_terminal(&coordinator, id).await;

    assert_eq!(view.submission.status, SubmissionStatus::Completed);
    let result = view.result.unwrap();
    assert_eq!(result.final_score, 50.0);

    let tree = result.result_tree.as_ref().unwrap();
    let base = tree.base.as_ref().unwrap();
    match &base.children[0] {
        gradeforge::models::ResultChild::Test(leaf) => {
            assert_eq!(leaf.status, TestStatus::Partial);
            assert_eq!(leaf.score, 50.0);
        }
        other => panic!("expected a test leaf, got {other:?}"),
    }

    // Focus ranks the partially failed test with its deficit.
    let focus = result.focus.as_ref().unwrap();
    assert_eq!(focus.base.len(), 1);
    assert!((focus.base[0].diff_score - 50.0).abs() < 1e-9);
}

#[tokio::test]
async fn hanging_program_scores_zero_but_completes() {
    let h = harness("python", FakeBackend::new().hang_on("python3 calc.py"));
    h.pool.initialize().await.unwrap();
    h.repository.create_config(io_config("a3")).await.unwrap();

    let id = h.coordinator.submit(python_submission("a3")).await.unwrap();
    let view = wait_terminal(&h.coordinator, id).await;

    // An exec timeout is a test-level infrastructure error, not a pipeline
    // failure.
    assert_eq!(view.submission.status, SubmissionStatus::Completed);
    let result = view.result.unwrap();
    assert_eq!(result.final_score, 0.0);

    let tree = result.result_tree.as_ref().unwrap();
    match &tree.base.as_ref().unwrap().children[0] {
        gradeforge::models::ResultChild::Test(leaf) => {
            assert_eq!(leaf.status, TestStatus::Error);
            assert!(leaf.report.contains("did not finish"));
        }
        other => panic!("expected a test leaf, got {other:?}"),
    }

    // The tainted environment was destroyed and is no longer pooled.
    assert_eq!(h.pool.leased_count(), 0);
    assert_eq!(h.backend.destroyed_count(), 1);
}

#[tokio::test]
async fn focus_orders_categories_by_deficit() {
    let repository = Arc::new(MemoryRepository::new());
    let coordinator = Coordinator::new(
        Arc::clone(&repository) as Arc<dyn Repository>,
        Arc::new(TemplateRegistry::builtin()),
        None,
        TestServices::new(),
        Arc::new(ReportFormatter::new().unwrap()),
        CoordinatorConfig::default(),
    );

    // main missing (0), nav present (100), footer missing under a nested
    // subject -> three distinct deficits.
    let criteria = serde_json::from_value(json!({
        "base": {
            "weight": 100,
            "subjects": [
                {"subject_name": "A", "weight": 30, "tests": [
                    {"name": "has_tag", "parameters": [{"name": "tag", "value": "main"}]}
                ]},
                {"subject_name": "B", "weight": 20, "tests": [
                    {"name": "has_tag", "parameters": [{"name": "tag", "value": "nav"}]}
                ]},
                {"subject_name": "C", "weight": 50, "subjects": [
                    {"subject_name": "C1", "weight": 10, "tests": [
                        {"name": "has_tag", "parameters": [{"name": "tag", "value": "footer"}]}
                    ]},
                    {"subject_name": "C2", "weight": 90, "tests": [
                        {"name": "has_tag", "parameters": [{"name": "tag", "value": "nav"}]}
                    ]}
                ]}
            ]
        }
    }))
    .unwrap();
    repository
        .create_config(GradingConfig::new("focus1", "webdev", criteria))
        .await
        .unwrap();

    let request = SubmissionRequest {
        assignment_id: "focus1".to_string(),
        user_id: "u4".to_string(),
        username: "sam".to_string(),
        language: None,
        files: vec![SubmissionFile::new("index.html", "<nav>menu</nav>")],
    };

    let id = coordinator.submit(request).await.unwrap();
    let view = wait_terminal(&coordinator, id).await;
    let result = view.result.unwrap();
    let focus = result.focus.as_ref().unwrap();

    // A: 100 deficit x 0.30 = 30; C1: 100 x 0.05 = 5; B and C2: 0.
    let diffs: Vec<(String, f64)> = focus
        .base
        .iter()
        .map(|e| (e.test.name.clone(), e.diff_score))
        .collect();
    assert!((diffs[0].1 - 30.0).abs() < 1e-9);
    assert!((diffs[1].1 - 5.0).abs() < 1e-9);
    assert!(diffs[2].1.abs() < 1e-9);
    assert!(diffs[3].1.abs() < 1e-9);
}

#[tokio::test]
async fn backpressure_fails_submission_inside_the_pipeline() {
    let repository = Arc::new(MemoryRepository::new());
    repository.create_config(io_config("a4")).await.unwrap();

    // A zero-size pool can never satisfy an acquisition, so every pipeline
    // waits out its deadline and fails in pre-flight.
    let mut pool_config =
        PoolConfig::single("python", LanguagePoolConfig::new("python:3.11-slim", 0));
    pool_config.acquire_timeout_secs = 1;
    let pool = SandboxPool::new(pool_config, Arc::new(FakeBackend::new()) as Arc<dyn SandboxBackend>);

    let coordinator = Coordinator::new(
        Arc::clone(&repository) as Arc<dyn Repository>,
        Arc::new(TemplateRegistry::builtin()),
        Some(pool),
        TestServices::new(),
        Arc::new(ReportFormatter::new().unwrap()),
        CoordinatorConfig::default(),
    );

    // Intake always accepts; the failure happens inside the pipeline.
    let id = coordinator.submit(python_submission("a4")).await.unwrap();
    let view = wait_terminal(&coordinator, id).await;

    assert_eq!(view.submission.status, SubmissionStatus::Failed);
    let result = view.result.unwrap();
    let error = result.execution.first_error().unwrap();
    assert_eq!(error.kind, ErrorKind::SandboxUnavailable);
    assert_eq!(
        result.execution.failed_at_step.as_deref(),
        Some("PRE_FLIGHT")
    );
}
