//! Remote execution agent backend.
//!
//! When the deployment provides a remote execution agent instead of a local
//! Docker daemon, the pool talks HTTP to it: `create` polls the agent's
//! readiness endpoint, `exec` posts commands, and port mapping is the agent's
//! static address. Choosing this substrate is a configuration-time decision,
//! invisible to tests.

use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SandboxError;

use super::backend::{
    Environment, EnvironmentSpec, ExecOutput, PortMapping, RunOptions, SandboxBackend,
};

/// Configuration for a remote execution agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAgentConfig {
    /// Base URL of the agent, e.g. `http://runner.internal:7070`.
    pub base_url: String,
    /// The agent's fixed student-server port, when it forwards one.
    #[serde(default)]
    pub static_port: Option<u16>,
    /// How long `create` may poll for agent readiness.
    #[serde(default = "default_ready_secs")]
    pub ready_timeout_secs: u64,
}

fn default_ready_secs() -> u64 {
    30
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    session: &'a str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdin: Option<&'a str>,
    timeout_secs: u64,
    background: bool,
    working_dir: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    exit_code: i64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    timed_out: bool,
}

#[derive(Debug, Serialize)]
struct FilesRequest<'a> {
    session: &'a str,
    files: &'a IndexMap<String, String>,
}

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    session: &'a str,
}

/// Sandbox backend proxying to a remote execution agent over HTTP.
pub struct RemoteBackend {
    config: RemoteAgentConfig,
    http: Client,
}

impl RemoteBackend {
    pub fn new(config: RemoteAgentConfig) -> Result<Self, SandboxError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SandboxError::Backend(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// The host the agent is reachable at, for port mapping.
    fn agent_host(&self) -> String {
        reqwest::Url::parse(&self.config.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Polls the agent's readiness endpoint, bounded by the configured
    /// timeout.
    async fn wait_ready(&self) -> Result<(), SandboxError> {
        let deadline = Duration::from_secs(self.config.ready_timeout_secs);
        let start = std::time::Instant::now();

        loop {
            match self.http.get(self.url("healthz")).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    tracing::debug!(status = %response.status(), "Agent not ready yet");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Agent not reachable yet");
                }
            }

            if start.elapsed() >= deadline {
                return Err(SandboxError::Unavailable {
                    language: "remote".to_string(),
                    waited: start.elapsed(),
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

#[async_trait]
impl SandboxBackend for RemoteBackend {
    async fn create(
        &self,
        language: &str,
        spec: &EnvironmentSpec,
    ) -> Result<Environment, SandboxError> {
        self.wait_ready().await?;

        let session = Uuid::new_v4().to_string();
        let ports = self
            .config
            .static_port
            .map(|port| {
                vec![PortMapping {
                    container_port: spec.container_port.unwrap_or(port),
                    host: self.agent_host(),
                    host_port: port,
                }]
            })
            .unwrap_or_default();

        tracing::debug!(session = %session, language = language, "Remote agent session opened");

        Ok(Environment {
            id: session,
            language: language.to_string(),
            working_dir: spec.working_dir.clone(),
            ports,
        })
    }

    async fn exec(
        &self,
        env: &Environment,
        command: &str,
        opts: &RunOptions,
    ) -> Result<ExecOutput, SandboxError> {
        let request = ExecRequest {
            session: &env.id,
            command,
            stdin: opts.stdin.as_deref(),
            timeout_secs: opts.deadline.as_secs(),
            background: opts.background,
            working_dir: &env.working_dir,
        };

        let response = self
            .http
            .post(self.url("exec"))
            .json(&request)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("Agent exec request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SandboxError::Backend(format!(
                "Agent exec returned {}",
                response.status()
            )));
        }

        let body: ExecResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Backend(format!("Bad agent exec response: {e}")))?;

        if body.timed_out {
            return Err(SandboxError::ExecTimeout {
                seconds: opts.deadline.as_secs(),
            });
        }

        Ok(ExecOutput {
            exit_code: body.exit_code,
            stdout: body.stdout,
            stderr: body.stderr,
        })
    }

    async fn upload(
        &self,
        env: &Environment,
        files: &IndexMap<String, String>,
    ) -> Result<(), SandboxError> {
        let request = FilesRequest {
            session: &env.id,
            files,
        };

        let response = self
            .http
            .post(self.url("files"))
            .json(&request)
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("Agent upload failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SandboxError::Backend(format!(
                "Agent upload returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn wipe(&self, env: &Environment) -> Result<(), SandboxError> {
        let response = self
            .http
            .post(self.url("reset"))
            .json(&SessionRequest { session: &env.id })
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("Agent reset failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SandboxError::Crashed(format!(
                "Agent reset returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn destroy(&self, env: &Environment) -> Result<(), SandboxError> {
        let response = self
            .http
            .post(self.url("teardown"))
            .json(&SessionRequest { session: &env.id })
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("Agent teardown failed: {e}")))?;

        if !response.status().is_success() {
            tracing::warn!(
                session = %env.id,
                status = %response.status(),
                "Agent teardown rejected; session may linger"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joining_trims_trailing_slash() {
        let backend = RemoteBackend::new(RemoteAgentConfig {
            base_url: "http://agent:7070/".to_string(),
            static_port: Some(3000),
            ready_timeout_secs: 1,
        })
        .unwrap();

        assert_eq!(backend.url("exec"), "http://agent:7070/exec");
        assert_eq!(backend.agent_host(), "agent");
    }
}
