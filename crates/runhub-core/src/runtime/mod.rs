//! Container runtimes for sandboxed program execution.
//!
//! The orchestrator and the build pipeline only talk to [`ContainerRuntime`]; the
//! production implementation is [`docker::DockerRuntime`], and [`memory::MemoryRuntime`]
//! stands in for it in tests.

use async_trait::async_trait;
use crate::errors::RuntimeError;

pub mod archive;
pub mod docker;
pub mod memory;

pub use docker::DockerRuntime;
pub use memory::MemoryRuntime;

/// Everything needed to create one execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub env: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a stopped container and returns its runtime-assigned identifier.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Extracts a tar archive into `path` inside the container.
    async fn upload(&self, id: &str, path: &str, archive: Vec<u8>) -> Result<(), RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Combined stdout and stderr captured so far.
    async fn logs(&self, id: &str) -> Result<String, RuntimeError>;

    /// Forcibly removes the container, stopping it first if needed.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}
