//! Docker-backed sandbox environments using the bollard crate.
//!
//! Each environment is a long-lived container kept alive by a no-op command
//! and hardened for untrusted code: unprivileged user, memory and pids
//! limits, `no-new-privileges`, and bridge networking only. Submission files
//! are delivered as an in-memory tar archive.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use indexmap::IndexMap;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::SandboxError;

use super::backend::{
    Environment, EnvironmentSpec, ExecOutput, PortMapping, RunOptions, SandboxBackend,
};

/// Unprivileged identity student code runs as.
const SANDBOX_USER: &str = "1000:1000";

/// Docker sandbox backend.
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Backend` if the daemon is not accessible.
    pub fn new() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Backend(format!("Failed to connect to Docker: {e}")))?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Pulls the image unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Backend(format!("Failed to pull '{image}': {e}")))?;
        }
        Ok(())
    }

    /// Reads the host binding Docker assigned to a forwarded container port.
    async fn discover_port(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<PortMapping, SandboxError> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to inspect container: {e}")))?;

        let key = format!("{container_port}/tcp");
        let binding = info
            .network_settings
            .and_then(|net| net.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .ok_or(SandboxError::NoPort {
                port: container_port,
            })?;

        let host_port = binding
            .host_port
            .as_deref()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or(SandboxError::NoPort {
                port: container_port,
            })?;

        Ok(PortMapping {
            container_port,
            host: binding.host_ip.unwrap_or_else(|| "127.0.0.1".to_string()),
            host_port,
        })
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn create(
        &self,
        language: &str,
        spec: &EnvironmentSpec,
    ) -> Result<Environment, SandboxError> {
        self.ensure_image(&spec.image).await?;

        let short_id = Uuid::new_v4().simple().to_string();
        let name = format!("gradeforge-{}-{}", language, &short_id[..12]);

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        if let Some(port) = spec.container_port {
            let key = format!("{port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            // Empty host_port asks Docker for an ephemeral port.
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(String::new()),
                }]),
            );
        }

        let host_config = HostConfig {
            memory: Some((spec.memory_mb * 1024 * 1024) as i64),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some("bridge".to_string()),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            // Keep-alive: the container idles until the pool destroys it.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(spec.working_dir.clone()),
            user: Some(SANDBOX_USER.to_string()),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to create container: {e}")))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to start container: {e}")))?;

        // Make sure the working directory exists and is writable by the
        // sandbox user before any files land in it.
        let prepare = format!(
            "mkdir -p {dir} && chown {user} {dir}",
            dir = spec.working_dir,
            user = SANDBOX_USER
        );
        let root_exec = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), prepare]),
            user: Some("0:0".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&created.id, root_exec)
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to prepare workdir: {e}")))?;
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to prepare workdir: {e}")))?
        {
            while output.next().await.is_some() {}
        }

        let mut ports = Vec::new();
        if let Some(container_port) = spec.container_port {
            ports.push(self.discover_port(&created.id, container_port).await?);
        }

        tracing::debug!(
            container = %name,
            image = %spec.image,
            language = language,
            "Sandbox environment ready"
        );

        Ok(Environment {
            id: created.id,
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
        let exec_options = CreateExecOptions {
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            attach_stdin: Some(opts.stdin.is_some()),
            attach_stdout: Some(!opts.background),
            attach_stderr: Some(!opts.background),
            working_dir: Some(env.working_dir.clone()),
            user: Some(SANDBOX_USER.to_string()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&env.id, exec_options)
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to create exec: {e}")))?;

        if opts.background {
            let start = StartExecOptions {
                detach: true,
                ..Default::default()
            };
            self.docker
                .start_exec(&exec.id, Some(start))
                .await
                .map_err(|e| SandboxError::Backend(format!("Failed to start exec: {e}")))?;
            return Ok(ExecOutput::ok());
        }

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to start exec: {e}")))?;

        let deadline = opts.deadline;
        let stdin = opts.stdin.clone();

        let drained = tokio::time::timeout(deadline, async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            if let StartExecResults::Attached {
                mut output,
                mut input,
            } = started
            {
                if let Some(data) = stdin {
                    input
                        .write_all(data.as_bytes())
                        .await
                        .map_err(SandboxError::Io)?;
                    input.shutdown().await.map_err(SandboxError::Io)?;
                }

                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(SandboxError::Crashed(format!(
                                "Error reading command output: {e}"
                            )));
                        }
                    }
                }
            }

            Ok((stdout, stderr))
        })
        .await;

        let (stdout, stderr) = match drained {
            Ok(result) => result?,
            Err(_) => {
                // The exec keeps running inside the container; the caller is
                // expected to taint the lease so release destroys it.
                return Err(SandboxError::ExecTimeout {
                    seconds: deadline.as_secs(),
                });
            }
        };

        let info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to inspect exec: {e}")))?;

        Ok(ExecOutput {
            exit_code: info.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn upload(
        &self,
        env: &Environment,
        files: &IndexMap<String, String>,
    ) -> Result<(), SandboxError> {
        let archive = build_tar(files)?;

        let options = UploadToContainerOptions {
            path: env.working_dir.clone(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(&env.id, Some(options), archive.into())
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to upload files: {e}")))?;

        Ok(())
    }

    async fn wipe(&self, env: &Environment) -> Result<(), SandboxError> {
        // Kill everything except the keep-alive (pid 1) and the wipe shell
        // itself, then clear the working directory.
        let script = format!(
            "for p in /proc/[0-9]*; do p=${{p#/proc/}}; \
             [ \"$p\" = 1 ] && continue; [ \"$p\" = $$ ] && continue; \
             kill -9 \"$p\" 2>/dev/null; done; \
             rm -rf {dir}/* {dir}/.[!.]* {dir}/..?* 2>/dev/null; true",
            dir = env.working_dir
        );

        let opts = RunOptions::default().with_deadline(Duration::from_secs(15));
        let output = self.exec(env, &script, &opts).await?;
        if !output.success() {
            return Err(SandboxError::Crashed(format!(
                "Sanitize exited with code {}: {}",
                output.exit_code, output.stderr
            )));
        }
        Ok(())
    }

    async fn destroy(&self, env: &Environment) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(&env.id, Some(options))
            .await
            .map_err(|e| SandboxError::Backend(format!("Failed to remove container: {e}")))?;

        tracing::debug!(container = %env.id, "Sandbox environment destroyed");
        Ok(())
    }
}

/// Builds an in-memory tar archive of submission files, owned by the
/// sandbox user.
fn build_tar(files: &IndexMap<String, String>) -> Result<Vec<u8>, SandboxError> {
    let mut builder = tar::Builder::new(Vec::new());

    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_uid(1000);
        header.set_gid(1000);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .map_err(SandboxError::Io)?;
    }

    builder.into_inner().map_err(SandboxError::Io)
}
