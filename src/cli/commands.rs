//! CLI commands: database migration, one-shot grading, and pool warm-up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::feedback::ReportFormatter;
use crate::models::{
    CriteriaConfig, FeedbackSettings, GradingConfig, SetupConfig, SubmissionFile,
    SubmissionRequest,
};
use crate::sandbox::{
    DockerBackend, FakeBackend, LanguagePoolConfig, PoolConfig, SandboxBackend, SandboxPool,
};
use crate::storage::{MemoryRepository, PostgresRepository, Repository};
use crate::templates::{TemplateRegistry, TestServices};

#[derive(Debug, Parser)]
#[command(name = "gradeforge", version, about = "Automated code grading service")]
pub struct Cli {
    /// Log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },

    /// Grade one submission directory against a rubric file and print the
    /// result as JSON.
    Grade {
        /// Rubric file (YAML or JSON).
        rubric: PathBuf,
        /// Directory containing the submission files.
        submission: PathBuf,
        /// Language tag for multi-language rubrics.
        #[arg(long)]
        language: Option<String>,
        /// Execution substrate for sandboxed templates.
        #[arg(long, value_enum, default_value = "docker")]
        backend: BackendKind,
        /// Pool configuration file; a single-environment default is derived
        /// from the rubric when omitted.
        #[arg(long)]
        pool_config: Option<PathBuf>,
    },

    /// Pre-warm a sandbox pool and report its state.
    Warm {
        /// Pool configuration file (YAML or JSON).
        #[arg(long)]
        pool_config: PathBuf,
        #[arg(long, value_enum, default_value = "docker")]
        backend: BackendKind,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendKind {
    Docker,
    Fake,
}

/// A rubric file: a grading config without the persistence bookkeeping.
#[derive(Debug, Deserialize)]
struct RubricFile {
    #[serde(default = "default_assignment_id")]
    assignment_id: String,
    template_name: String,
    #[serde(default)]
    languages: Vec<String>,
    criteria: CriteriaConfig,
    #[serde(default)]
    setup: Option<SetupConfig>,
    #[serde(default)]
    feedback: Option<FeedbackSettings>,
}

fn default_assignment_id() -> String {
    "local".to_string()
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Migrate { database_url } => migrate(&database_url).await,
        Command::Grade {
            rubric,
            submission,
            language,
            backend,
            pool_config,
        } => grade(&rubric, &submission, language, backend, pool_config.as_deref()).await,
        Command::Warm {
            pool_config,
            backend,
        } => warm(&pool_config, backend).await,
    }
}

async fn migrate(database_url: &str) -> anyhow::Result<()> {
    let repository = PostgresRepository::connect(database_url)
        .await
        .context("connecting to the database")?;
    repository
        .run_migrations()
        .await
        .context("running migrations")?;
    println!("migrations applied");
    Ok(())
}

async fn grade(
    rubric_path: &Path,
    submission_dir: &Path,
    language: Option<String>,
    backend: BackendKind,
    pool_config: Option<&Path>,
) -> anyhow::Result<()> {
    let rubric: RubricFile = read_document(rubric_path)?;
    let registry = Arc::new(TemplateRegistry::builtin());

    let template = registry
        .get(rubric.criteria.test_library.as_deref().unwrap_or(&rubric.template_name))
        .with_context(|| format!("unknown template '{}'", rubric.template_name))?;

    let mut config = GradingConfig::new(
        rubric.assignment_id.clone(),
        rubric.template_name.clone(),
        rubric.criteria.clone(),
    )
    .with_languages(rubric.languages.clone());
    config.setup = rubric.setup.clone();
    if let Some(feedback) = rubric.feedback.clone() {
        config.feedback = feedback;
    }

    let repository = Arc::new(MemoryRepository::new());
    repository
        .create_config(config)
        .await
        .context("registering the rubric")?;

    // Sandboxed templates need a pool; derive a one-environment default
    // when no pool config is given.
    let pool = if template.requires_sandbox() {
        let pool_config = match pool_config {
            Some(path) => read_document::<PoolConfig>(path)?,
            None => {
                let tag = language
                    .clone()
                    .or_else(|| rubric.languages.first().cloned())
                    .unwrap_or_else(|| "python".to_string());
                let image = default_image(&tag);
                PoolConfig::single(tag, LanguagePoolConfig::new(image, 1))
            }
        };
        let pool = SandboxPool::new(pool_config, make_backend(backend)?);
        pool.initialize().await.context("warming the sandbox pool")?;
        Some(pool)
    } else {
        None
    };

    let coordinator_config = pool
        .as_ref()
        .map(CoordinatorConfig::for_pool)
        .unwrap_or_default();
    let coordinator = Coordinator::new(
        repository,
        registry,
        pool.clone(),
        TestServices::new(),
        Arc::new(ReportFormatter::new().context("building the report formatter")?),
        coordinator_config,
    );

    let request = SubmissionRequest {
        assignment_id: rubric.assignment_id,
        user_id: "cli".to_string(),
        username: whoami(),
        language,
        files: read_submission(submission_dir)?,
    };

    let id = coordinator.submit(request).await?;
    let view = loop {
        let view = coordinator.poll(id).await?;
        if view.submission.status.is_terminal() {
            break view;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    println!("{}", serde_json::to_string_pretty(&view)?);

    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    Ok(())
}

async fn warm(pool_config: &Path, backend: BackendKind) -> anyhow::Result<()> {
    let config: PoolConfig = read_document(pool_config)?;
    let pool = SandboxPool::new(config, make_backend(backend)?);

    pool.initialize().await.context("warming the sandbox pool")?;
    println!("warmed {} environment(s)", pool.idle_count().await);
    pool.shutdown().await;
    Ok(())
}

fn make_backend(kind: BackendKind) -> anyhow::Result<Arc<dyn SandboxBackend>> {
    Ok(match kind {
        BackendKind::Docker => Arc::new(DockerBackend::new()?),
        BackendKind::Fake => Arc::new(FakeBackend::new()),
    })
}

fn default_image(language: &str) -> &'static str {
    match language {
        "python" => "python:3.11-slim",
        "java" => "eclipse-temurin:21-jdk",
        "node" | "javascript" => "node:20-slim",
        _ => "ubuntu:24.04",
    }
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let parsed = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
    };
    Ok(parsed)
}

fn read_submission(dir: &Path) -> anyhow::Result<Vec<SubmissionFile>> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }

    let mut files = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_file() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            files.push(SubmissionFile::new(name, content));
        }
    }

    if files.is_empty() {
        bail!("{} contains no files", dir.display());
    }
    Ok(files)
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string())
}
