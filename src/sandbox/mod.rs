//! Isolated execution environments for student code.
//!
//! The pool ([`SandboxPool`]) amortizes environment creation by keeping
//! per-language warmed sets; the substrate behind it is pluggable through
//! [`SandboxBackend`]: Docker ([`DockerBackend`]), a remote execution agent
//! ([`RemoteBackend`]), or an in-memory fake ([`FakeBackend`]).

pub mod backend;
pub mod docker;
pub mod fake;
pub mod pool;
pub mod remote;

pub use backend::{
    Environment, EnvironmentSpec, ExecOutput, PortMapping, RunOptions, SandboxBackend,
};
pub use docker::DockerBackend;
pub use fake::FakeBackend;
pub use pool::{LanguagePoolConfig, PoolConfig, SandboxLease, SandboxPool};
pub use remote::{RemoteAgentConfig, RemoteBackend};
