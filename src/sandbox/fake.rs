//! In-memory sandbox backend with scriptable command responses.
//!
//! Backs unit and integration tests, and the occasional dry run, without a
//! container runtime. Commands are matched by substring against registered
//! rules; unmatched commands succeed with empty output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::error::SandboxError;

use super::backend::{
    Environment, EnvironmentSpec, ExecOutput, PortMapping, RunOptions, SandboxBackend,
};

/// A scriptable fake substrate.
#[derive(Default)]
pub struct FakeBackend {
    /// `(substring, response)` rules, first match wins.
    rules: Mutex<Vec<(String, ExecOutput)>>,
    /// Substrings whose commands simulate a deadline expiry.
    hangs: Mutex<Vec<String>>,
    /// Files currently injected, per environment id.
    files: Mutex<HashMap<String, IndexMap<String, String>>>,
    /// Every command executed, in order.
    commands: Mutex<Vec<String>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_wipe: AtomicBool,
    next_id: AtomicUsize,
    /// Fixed host port for every created environment, instead of the
    /// synthetic default. Lets tests point port mappings at a local server.
    static_host_port: Mutex<Option<u16>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a canned response for commands containing `pattern`.
    pub fn with_response(self, pattern: impl Into<String>, output: ExecOutput) -> Self {
        self.add_response(pattern, output);
        self
    }

    /// Registers a canned response after construction.
    pub fn add_response(&self, pattern: impl Into<String>, output: ExecOutput) {
        self.rules
            .lock()
            .expect("rules lock poisoned")
            .push((pattern.into(), output));
    }

    /// Every created environment maps its container port to this host port.
    pub fn with_static_host_port(self, port: u16) -> Self {
        *self
            .static_host_port
            .lock()
            .expect("static port lock poisoned") = Some(port);
        self
    }

    /// Commands containing `pattern` will return an exec timeout.
    pub fn hang_on(self, pattern: impl Into<String>) -> Self {
        self.hangs
            .lock()
            .expect("hangs lock poisoned")
            .push(pattern.into());
        self
    }

    /// Makes every subsequent `wipe` fail, forcing the destroy-and-replace
    /// release path.
    pub fn set_fail_wipe(&self, fail: bool) {
        self.fail_wipe.store(fail, Ordering::SeqCst);
    }

    /// Files currently injected into an environment.
    pub fn files_in(&self, env_id: &str) -> IndexMap<String, String> {
        self.files
            .lock()
            .expect("files lock poisoned")
            .get(env_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock poisoned").clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Environments created and not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.created_count() - self.destroyed_count()
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    async fn create(
        &self,
        language: &str,
        spec: &EnvironmentSpec,
    ) -> Result<Environment, SandboxError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);

        let static_port = *self
            .static_host_port
            .lock()
            .expect("static port lock poisoned");
        let ports = spec
            .container_port
            .map(|port| {
                vec![PortMapping {
                    container_port: port,
                    host: "127.0.0.1".to_string(),
                    host_port: static_port.unwrap_or(40000 + n as u16),
                }]
            })
            .unwrap_or_default();

        Ok(Environment {
            id: format!("fake-{language}-{n}"),
            language: language.to_string(),
            working_dir: spec.working_dir.clone(),
            ports,
        })
    }

    async fn exec(
        &self,
        _env: &Environment,
        command: &str,
        opts: &RunOptions,
    ) -> Result<ExecOutput, SandboxError> {
        self.commands
            .lock()
            .expect("commands lock poisoned")
            .push(command.to_string());

        if opts.background {
            return Ok(ExecOutput::ok());
        }

        let hangs = self.hangs.lock().expect("hangs lock poisoned");
        if hangs.iter().any(|p| command.contains(p.as_str())) {
            return Err(SandboxError::ExecTimeout {
                seconds: opts.deadline.as_secs(),
            });
        }
        drop(hangs);

        let rules = self.rules.lock().expect("rules lock poisoned");
        for (pattern, output) in rules.iter() {
            if command.contains(pattern.as_str()) {
                return Ok(output.clone());
            }
        }

        Ok(ExecOutput::ok())
    }

    async fn upload(
        &self,
        env: &Environment,
        files: &IndexMap<String, String>,
    ) -> Result<(), SandboxError> {
        self.files
            .lock()
            .expect("files lock poisoned")
            .entry(env.id.clone())
            .or_default()
            .extend(files.clone());
        Ok(())
    }

    async fn wipe(&self, env: &Environment) -> Result<(), SandboxError> {
        if self.fail_wipe.load(Ordering::SeqCst) {
            return Err(SandboxError::Crashed("sanitize failed".to_string()));
        }
        self.files
            .lock()
            .expect("files lock poisoned")
            .remove(&env.id);
        Ok(())
    }

    async fn destroy(&self, env: &Environment) -> Result<(), SandboxError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .expect("files lock poisoned")
            .remove(&env.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            image: "python:3.11-slim".to_string(),
            working_dir: "/work".to_string(),
            container_port: None,
            memory_mb: 512,
            pids_limit: 128,
        }
    }

    #[tokio::test]
    async fn scripted_responses_match_by_substring() {
        let backend = FakeBackend::new()
            .with_response("python3 calc.py", ExecOutput::new(0, "8\n", ""));
        let env = backend.create("python", &spec()).await.unwrap();

        let hit = backend
            .exec(&env, "python3 calc.py", &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(hit.stdout, "8\n");

        let miss = backend
            .exec(&env, "echo other", &RunOptions::default())
            .await
            .unwrap();
        assert!(miss.stdout.is_empty());
        assert_eq!(backend.commands().len(), 2);
    }

    #[tokio::test]
    async fn hang_rule_times_out() {
        let backend = FakeBackend::new().hang_on("sleep 9999");
        let env = backend.create("python", &spec()).await.unwrap();

        let err = backend
            .exec(&env, "sleep 9999", &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ExecTimeout { .. }));
    }

    #[tokio::test]
    async fn wipe_clears_files_and_can_fail() {
        let backend = FakeBackend::new();
        let env = backend.create("python", &spec()).await.unwrap();

        let mut files = IndexMap::new();
        files.insert("a.py".to_string(), "pass".to_string());
        backend.upload(&env, &files).await.unwrap();
        assert_eq!(backend.files_in(&env.id).len(), 1);

        backend.wipe(&env).await.unwrap();
        assert!(backend.files_in(&env.id).is_empty());

        backend.set_fail_wipe(true);
        assert!(backend.wipe(&env).await.is_err());
    }
}
