//! Pre-warmed sandbox pool with deadline-bounded acquisition.
//!
//! The pool owns every environment the backend creates. Each language tag
//! has a warmed set of idle environments; `acquire` hands out exclusive
//! [`SandboxLease`]s and `release` sanitizes or destroys. All state
//! transitions (`idle <-> in-use <-> destroyed`) happen under one mutex.
//!
//! Leases must be released on every pipeline exit path. Dropping an
//! unreleased lease spawns a background release as the leak backstop, so the
//! invariant "environments held at pipeline start == environments held at
//! end" survives panics and cancellation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use crate::error::SandboxError;

use super::backend::{Environment, EnvironmentSpec, ExecOutput, RunOptions, SandboxBackend};

/// Per-language pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguagePoolConfig {
    /// Image to warm environments from.
    pub image: String,
    /// How many environments to keep warm.
    pub pool_size: usize,
    /// Working directory convention inside environments.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Container port forwarded for network-facing tests.
    #[serde(default)]
    pub container_port: Option<u16>,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_working_dir() -> String {
    "/work".to_string()
}

fn default_memory_mb() -> u64 {
    512
}

fn default_pids_limit() -> i64 {
    128
}

impl LanguagePoolConfig {
    pub fn new(image: impl Into<String>, pool_size: usize) -> Self {
        Self {
            image: image.into(),
            pool_size,
            working_dir: default_working_dir(),
            container_port: None,
            memory_mb: default_memory_mb(),
            pids_limit: default_pids_limit(),
        }
    }

    pub fn with_container_port(mut self, port: u16) -> Self {
        self.container_port = Some(port);
        self
    }

    fn spec(&self) -> EnvironmentSpec {
        EnvironmentSpec {
            image: self.image.clone(),
            working_dir: self.working_dir.clone(),
            container_port: self.container_port,
            memory_mb: self.memory_mb,
            pids_limit: self.pids_limit,
        }
    }
}

/// Pool-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Per-language environment settings, keyed by language tag.
    pub languages: IndexMap<String, LanguagePoolConfig>,
    /// Global cap on concurrently existing environments.
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    /// Default acquisition deadline.
    #[serde(default = "default_acquire_secs")]
    pub acquire_timeout_secs: u64,
    /// Deadline for setup commands.
    #[serde(default = "default_setup_secs")]
    pub setup_timeout_secs: u64,
    /// Default deadline for test commands.
    #[serde(default = "default_test_secs")]
    pub test_timeout_secs: u64,
}

fn default_max_total() -> usize {
    16
}

fn default_acquire_secs() -> u64 {
    60
}

fn default_setup_secs() -> u64 {
    30
}

fn default_test_secs() -> u64 {
    30
}

impl PoolConfig {
    pub fn new(languages: IndexMap<String, LanguagePoolConfig>) -> Self {
        Self {
            languages,
            max_total: default_max_total(),
            acquire_timeout_secs: default_acquire_secs(),
            setup_timeout_secs: default_setup_secs(),
            test_timeout_secs: default_test_secs(),
        }
    }

    /// Convenience for a single-language pool.
    pub fn single(language: impl Into<String>, config: LanguagePoolConfig) -> Self {
        let mut languages = IndexMap::new();
        languages.insert(language.into(), config);
        Self::new(languages)
    }

    pub fn acquire_deadline(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn setup_deadline(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }

    pub fn test_deadline(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    /// Sum of configured pool sizes; the coordinator sizes its executor
    /// against this.
    pub fn total_pool_size(&self) -> usize {
        self.languages.values().map(|l| l.pool_size).sum()
    }
}

struct PoolState {
    idle: HashMap<String, VecDeque<Environment>>,
    /// Environments that exist (idle or leased) per language.
    totals: HashMap<String, usize>,
    grand_total: usize,
}

struct PoolInner {
    backend: Arc<dyn SandboxBackend>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
    closed: AtomicBool,
    leased: AtomicUsize,
}

impl PoolInner {
    async fn release_env(&self, env: Environment, tainted: bool) {
        self.leased.fetch_sub(1, Ordering::SeqCst);

        if self.closed.load(Ordering::SeqCst) {
            self.drop_env(env).await;
            return;
        }

        if !tainted {
            match self.backend.wipe(&env).await {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    state
                        .idle
                        .entry(env.language.clone())
                        .or_default()
                        .push_back(env);
                    drop(state);
                    self.notify.notify_waiters();
                    crate::metrics::observe_pool(self.leased.load(Ordering::SeqCst));
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        environment = %env.id,
                        error = %e,
                        "Sanitize failed; destroying environment"
                    );
                }
            }
        }

        // Tainted or unsanitizable: destroy and let acquire recreate lazily.
        self.drop_env(env).await;
        self.notify.notify_waiters();
        crate::metrics::observe_pool(self.leased.load(Ordering::SeqCst));
    }

    /// Destroys an environment and forgets it from the totals.
    async fn drop_env(&self, env: Environment) {
        if let Err(e) = self.backend.destroy(&env).await {
            tracing::error!(environment = %env.id, error = %e, "Failed to destroy environment");
        }
        let mut state = self.state.lock().await;
        if let Some(count) = state.totals.get_mut(&env.language) {
            *count = count.saturating_sub(1);
        }
        state.grand_total = state.grand_total.saturating_sub(1);
    }
}

/// The process-wide sandbox pool.
///
/// Cloning is cheap; all clones share the same state. Inject it as an
/// explicit dependency rather than reaching through globals, so graders can
/// run against a fake backend.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

enum AcquirePlan {
    Create(LanguagePoolConfig),
    Wait,
}

impl SandboxPool {
    pub fn new(config: PoolConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                backend,
                config,
                state: Mutex::new(PoolState {
                    idle: HashMap::new(),
                    totals: HashMap::new(),
                    grand_total: 0,
                }),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                leased: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Pre-warms every language's pool to its configured size.
    pub async fn initialize(&self) -> Result<(), SandboxError> {
        for (language, lang_config) in &self.inner.config.languages {
            for _ in 0..lang_config.pool_size {
                {
                    let state = self.inner.state.lock().await;
                    if state.grand_total >= self.inner.config.max_total {
                        tracing::warn!(
                            language = %language,
                            cap = self.inner.config.max_total,
                            "Global environment cap reached during warm-up"
                        );
                        return Ok(());
                    }
                }

                let env = self.inner.backend.create(language, &lang_config.spec()).await?;
                let mut state = self.inner.state.lock().await;
                state
                    .idle
                    .entry(language.clone())
                    .or_default()
                    .push_back(env);
                *state.totals.entry(language.clone()).or_insert(0) += 1;
                state.grand_total += 1;
            }
            tracing::info!(
                language = %language,
                pool_size = lang_config.pool_size,
                image = %lang_config.image,
                "Sandbox pool warmed"
            );
        }
        Ok(())
    }

    /// Acquires an exclusive lease on an idle environment for `language`,
    /// waiting up to `deadline`.
    ///
    /// # Errors
    ///
    /// - `SandboxError::Misconfigured` for an unknown language tag.
    /// - `SandboxError::Unavailable` when the deadline expires first.
    /// - `SandboxError::ShutDown` after `shutdown`.
    pub async fn acquire(
        &self,
        language: &str,
        deadline: Duration,
    ) -> Result<SandboxLease, SandboxError> {
        let lang_config = self
            .inner
            .config
            .languages
            .get(language)
            .cloned()
            .ok_or_else(|| {
                SandboxError::Misconfigured(format!("no sandbox pool for language '{language}'"))
            })?;

        let start = Instant::now();

        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(SandboxError::ShutDown);
            }

            // Register interest before inspecting state, so a release
            // between the check and the wait cannot be missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let plan = {
                let mut state = self.inner.state.lock().await;
                if let Some(env) = state.idle.get_mut(language).and_then(VecDeque::pop_front) {
                    drop(state);
                    return Ok(self.lease(env));
                }

                let total = state.totals.get(language).copied().unwrap_or(0);
                if total < lang_config.pool_size && state.grand_total < self.inner.config.max_total
                {
                    // Reserve the slot before creating outside the lock.
                    *state.totals.entry(language.to_string()).or_insert(0) += 1;
                    state.grand_total += 1;
                    AcquirePlan::Create(lang_config.clone())
                } else {
                    AcquirePlan::Wait
                }
            };

            match plan {
                AcquirePlan::Create(config) => {
                    match self.inner.backend.create(language, &config.spec()).await {
                        Ok(env) => return Ok(self.lease(env)),
                        Err(e) => {
                            let mut state = self.inner.state.lock().await;
                            if let Some(count) = state.totals.get_mut(language) {
                                *count = count.saturating_sub(1);
                            }
                            state.grand_total = state.grand_total.saturating_sub(1);
                            drop(state);
                            self.inner.notify.notify_waiters();
                            return Err(e);
                        }
                    }
                }
                AcquirePlan::Wait => {
                    let Some(remaining) = deadline.checked_sub(start.elapsed()) else {
                        return Err(SandboxError::Unavailable {
                            language: language.to_string(),
                            waited: start.elapsed(),
                        });
                    };

                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return Err(SandboxError::Unavailable {
                            language: language.to_string(),
                            waited: start.elapsed(),
                        });
                    }
                }
            }
        }
    }

    fn lease(&self, env: Environment) -> SandboxLease {
        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        crate::metrics::observe_pool(self.inner.leased.load(Ordering::SeqCst));
        SandboxLease {
            env: Some(env),
            inner: Arc::clone(&self.inner),
            tainted: AtomicBool::new(false),
        }
    }

    /// Environments currently leased out.
    pub fn leased_count(&self) -> usize {
        self.inner.leased.load(Ordering::SeqCst)
    }

    /// Idle environments across all languages.
    pub async fn idle_count(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.idle.values().map(VecDeque::len).sum()
    }

    /// Destroys every environment. In-flight leases are destroyed when
    /// released.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let drained: Vec<Environment> = {
            let mut state = self.inner.state.lock().await;
            state.idle.values_mut().flat_map(|q| q.drain(..)).collect()
        };

        for env in drained {
            self.inner.drop_env(env).await;
        }
        self.inner.notify.notify_waiters();
        tracing::info!("Sandbox pool shut down");
    }
}

/// Exclusive ownership of one environment for the duration of a grading run.
///
/// Obtain via [`SandboxPool::acquire`]; give back with
/// [`SandboxLease::release`]. Dropping without releasing spawns a background
/// release and logs a warning.
pub struct SandboxLease {
    env: Option<Environment>,
    inner: Arc<PoolInner>,
    tainted: AtomicBool,
}

impl std::fmt::Debug for SandboxLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxLease")
            .field("env", &self.env)
            .field("tainted", &self.tainted.load(Ordering::SeqCst))
            .finish()
    }
}

impl SandboxLease {
    fn env(&self) -> &Environment {
        self.env
            .as_ref()
            .expect("lease environment taken before release")
    }

    pub fn environment_id(&self) -> &str {
        &self.env().id
    }

    pub fn language(&self) -> &str {
        &self.env().language
    }

    pub fn working_dir(&self) -> &str {
        &self.env().working_dir
    }

    /// All configured port mappings.
    pub fn port_mappings(&self) -> &[super::backend::PortMapping] {
        &self.env().ports
    }

    /// First forwarded container port, if the pool configured one.
    pub fn mapped_port_any(&self) -> Option<u16> {
        self.env().ports.first().map(|p| p.container_port)
    }

    /// Host address for a forwarded container port.
    pub fn mapped_port(&self, container_port: u16) -> Result<(String, u16), SandboxError> {
        self.env()
            .ports
            .iter()
            .find(|p| p.container_port == container_port)
            .map(|p| (p.host.clone(), p.host_port))
            .ok_or(SandboxError::NoPort {
                port: container_port,
            })
    }

    /// Runs a shell command in the environment.
    ///
    /// A deadline expiry taints the lease: the command may still be running,
    /// so the environment is destroyed on release instead of reused.
    pub async fn run(&self, command: &str, opts: &RunOptions) -> Result<ExecOutput, SandboxError> {
        match self.inner.backend.exec(self.env(), command, opts).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if matches!(
                    e,
                    SandboxError::ExecTimeout { .. } | SandboxError::Crashed(_)
                ) {
                    self.taint();
                }
                Err(e)
            }
        }
    }

    /// Places the submission's files into the working directory.
    pub async fn inject_files(
        &self,
        files: &IndexMap<String, String>,
    ) -> Result<(), SandboxError> {
        self.inner.backend.upload(self.env(), files).await
    }

    /// Marks the environment as unsafe to reuse.
    pub fn taint(&self) {
        self.tainted.store(true, Ordering::SeqCst);
    }

    /// Sanitizes the environment and returns it to the pool, or destroys it
    /// when tainted.
    pub async fn release(mut self) {
        if let Some(env) = self.env.take() {
            let tainted = self.tainted.load(Ordering::SeqCst);
            self.inner.release_env(env, tainted).await;
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if let Some(env) = self.env.take() {
            tracing::warn!(
                environment = %env.id,
                "Sandbox lease dropped without release; releasing in background"
            );
            let inner = Arc::clone(&self.inner);
            let tainted = self.tainted.load(Ordering::SeqCst);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    inner.release_env(env, tainted).await;
                });
            } else {
                tracing::error!(
                    environment = %env.id,
                    "No runtime available to release leaked lease"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::FakeBackend;

    fn pool_with(backend: Arc<FakeBackend>, size: usize) -> SandboxPool {
        let config = PoolConfig::single("python", LanguagePoolConfig::new("python:3.11-slim", size));
        SandboxPool::new(config, backend)
    }

    #[tokio::test]
    async fn initialize_warms_to_pool_size() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(Arc::clone(&backend), 3);

        pool.initialize().await.unwrap();
        assert_eq!(backend.created_count(), 3);
        assert_eq!(pool.idle_count().await, 3);
        assert_eq!(pool.leased_count(), 0);
    }

    #[tokio::test]
    async fn acquire_release_round_trip() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(Arc::clone(&backend), 1);
        pool.initialize().await.unwrap();

        let lease = pool
            .acquire("python", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pool.leased_count(), 1);
        assert_eq!(pool.idle_count().await, 0);

        lease.release().await;
        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.idle_count().await, 1);
        // Sanitized and reused, not destroyed.
        assert_eq!(backend.destroyed_count(), 0);
    }

    #[tokio::test]
    async fn acquire_unknown_language_is_misconfigured() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(backend, 1);

        let err = pool
            .acquire("cobol", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(backend, 1);
        pool.initialize().await.unwrap();

        let _held = pool
            .acquire("python", Duration::from_secs(1))
            .await
            .unwrap();

        let err = pool
            .acquire("python", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn waiting_acquire_wakes_on_release() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(backend, 1);
        pool.initialize().await.unwrap();

        let lease = pool
            .acquire("python", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("python", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        lease.release().await;

        let lease2 = waiter.await.unwrap().unwrap();
        assert_eq!(pool.leased_count(), 1);
        lease2.release().await;
    }

    #[tokio::test]
    async fn failed_sanitize_destroys_and_replaces_lazily() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(Arc::clone(&backend), 1);
        pool.initialize().await.unwrap();

        let lease = pool
            .acquire("python", Duration::from_secs(1))
            .await
            .unwrap();
        backend.set_fail_wipe(true);
        lease.release().await;

        assert_eq!(backend.destroyed_count(), 1);
        assert_eq!(pool.idle_count().await, 0);

        // Next acquire recreates up to pool size.
        backend.set_fail_wipe(false);
        let lease = pool
            .acquire("python", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(backend.created_count(), 2);
        lease.release().await;
    }

    #[tokio::test]
    async fn timed_out_command_taints_lease() {
        let backend = Arc::new(FakeBackend::new().hang_on("sleep"));
        let pool = pool_with(Arc::clone(&backend), 1);
        pool.initialize().await.unwrap();

        let lease = pool
            .acquire("python", Duration::from_secs(1))
            .await
            .unwrap();
        let err = lease
            .run("sleep 9999", &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ExecTimeout { .. }));

        lease.release().await;
        // Tainted environments are destroyed, not reused.
        assert_eq!(backend.destroyed_count(), 1);
    }

    #[tokio::test]
    async fn dropped_lease_releases_in_background() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(Arc::clone(&backend), 1);
        pool.initialize().await.unwrap();

        {
            let _lease = pool
                .acquire("python", Duration::from_secs(1))
                .await
                .unwrap();
            // Dropped here without an explicit release.
        }

        // Give the spawned release a moment to run.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.leased_count(), 0);
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_destroys_everything() {
        let backend = Arc::new(FakeBackend::new());
        let pool = pool_with(Arc::clone(&backend), 2);
        pool.initialize().await.unwrap();

        pool.shutdown().await;
        assert_eq!(backend.live_count(), 0);

        let err = pool
            .acquire("python", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ShutDown));
    }

    #[tokio::test]
    async fn global_cap_bounds_creation() {
        let mut languages = IndexMap::new();
        languages.insert(
            "python".to_string(),
            LanguagePoolConfig::new("python:3.11-slim", 4),
        );
        let mut config = PoolConfig::new(languages);
        config.max_total = 2;

        let backend = Arc::new(FakeBackend::new());
        let pool = SandboxPool::new(config, Arc::clone(&backend) as Arc<dyn SandboxBackend>);
        pool.initialize().await.unwrap();

        assert_eq!(backend.created_count(), 2);
    }
}
