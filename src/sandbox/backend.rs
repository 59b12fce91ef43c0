//! The execution-substrate contract behind the sandbox pool.
//!
//! A backend knows how to create, command, and destroy isolated
//! environments. The pool is substrate-agnostic: Docker ([`super::docker`]),
//! a remote execution agent ([`super::remote`]), and an in-memory fake
//! ([`super::fake`]) all implement this trait.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Result of executing a command inside an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn new(exit_code: i64, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// An empty, successful output.
    pub fn ok() -> Self {
        Self::new(0, "", "")
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for a single command execution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Piped to the command's stdin when present.
    pub stdin: Option<String>,
    /// The command is terminated when this expires.
    pub deadline: Duration,
    /// Detach and return immediately without capturing output.
    pub background: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stdin: None,
            deadline: Duration::from_secs(30),
            background: false,
        }
    }
}

impl RunOptions {
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn detached(mut self) -> Self {
        self.background = true;
        self
    }
}

/// A container-port to host-address mapping for network-facing tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host: String,
    pub host_port: u16,
}

/// A handle on one isolated environment.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Opaque backend identifier (container id, agent session, ...).
    pub id: String,
    pub language: String,
    /// Fixed working directory convention inside the environment.
    pub working_dir: String,
    pub ports: Vec<PortMapping>,
}

/// What to create an environment from.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub image: String,
    pub working_dir: String,
    /// Container port to forward to a host port, when the assignment family
    /// runs network-facing tests.
    pub container_port: Option<u16>,
    pub memory_mb: u64,
    pub pids_limit: i64,
}

/// Substrate operations the pool builds on.
///
/// Implementations must be safe to call concurrently for distinct
/// environments; the pool guarantees a given environment is only ever
/// commanded by one owner at a time.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Creates and starts an isolated environment, kept alive until
    /// destroyed.
    async fn create(
        &self,
        language: &str,
        spec: &EnvironmentSpec,
    ) -> Result<Environment, SandboxError>;

    /// Executes a shell command in the environment's working directory as
    /// the unprivileged sandbox user.
    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        opts: &RunOptions,
    ) -> Result<ExecOutput, SandboxError>;

    /// Places files into the environment's working directory.
    async fn upload(
        &self,
        env: &Environment,
        files: &IndexMap<String, String>,
    ) -> Result<(), SandboxError>;

    /// Removes all submission files and processes, restoring the environment
    /// to a reusable state.
    async fn wipe(&self, env: &Environment) -> Result<(), SandboxError>;

    /// Tears the environment down.
    async fn destroy(&self, env: &Environment) -> Result<(), SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_options_builder() {
        let opts = RunOptions::default()
            .with_stdin("5\n3\n")
            .with_deadline(Duration::from_secs(10));

        assert_eq!(opts.stdin.as_deref(), Some("5\n3\n"));
        assert_eq!(opts.deadline, Duration::from_secs(10));
        assert!(!opts.background);
        assert!(RunOptions::default().detached().background);
    }

    #[test]
    fn exec_output_success() {
        assert!(ExecOutput::ok().success());
        assert!(!ExecOutput::new(2, "", "boom").success());
    }
}
