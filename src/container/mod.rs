//! Container abstraction — the boundary between the invoker core and the
//! container runtime.
//!
//! The core only ever talks to `Container` and `ContainerFactory` trait
//! objects; `docker` provides the production implementation and `mock` an
//! in-memory one used across the test suites.

pub mod docker;
pub mod health;
pub mod mock;

use crate::activation::{ActionRef, ActivationResponse, Interval, TransactionId};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Result of one container /run call
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Wall-clock interval of the run
    pub interval: Interval,
    /// Response document produced by the runtime
    pub response: ActivationResponse,
    /// Whether the run was cut off by the action timeout
    pub timed_out: bool,
}

/// Handle to one running container process
#[async_trait]
pub trait Container: Send + Sync + std::fmt::Debug {
    /// Runtime-assigned container id
    fn container_id(&self) -> &str;

    /// IP and port of the in-container runtime proxy
    fn addr(&self) -> (String, u16);

    /// Specialize the container for an action (ships code to /init)
    async fn initialize(
        &self,
        init_body: serde_json::Value,
        timeout: Duration,
        max_concurrent: u32,
    ) -> Result<Interval>;

    /// Execute one activation (/run)
    async fn run(
        &self,
        params: serde_json::Value,
        env: serde_json::Value,
        timeout: Duration,
        max_concurrent: u32,
        reschedule: bool,
    ) -> Result<RunOutput>;

    /// Ask the runtime proxy to load an additional model into memory (/load)
    async fn load(
        &self,
        params: serde_json::Value,
        env: serde_json::Value,
        timeout: Duration,
        max_concurrent: u32,
    ) -> Result<()>;

    /// Ask the runtime proxy to drop a previously loaded model (/offload)
    async fn offload(
        &self,
        params: serde_json::Value,
        env: serde_json::Value,
        timeout: Duration,
        max_concurrent: u32,
    ) -> Result<()>;

    /// Tear the container down
    async fn destroy(&self) -> Result<()>;
}

/// Async trait for creating containers
#[async_trait]
pub trait ContainerFactory: Send + Sync {
    /// Create and start a container.
    ///
    /// Errors are classified: `InvokerError::ImagePull` is a developer fault,
    /// `InvokerError::ContainerStart` a platform fault.
    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        tid: &TransactionId,
        name: &str,
        image: &str,
        pull: bool,
        memory_mb: u64,
        cpu_shares: u32,
        action: Option<&ActionRef>,
    ) -> Result<Arc<dyn Container>>;

    /// Factory name (for logging)
    fn name(&self) -> &str;
}
