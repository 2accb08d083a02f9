//! # icebreaker
//!
//! A serverless FaaS invoker with an opportunistic ML-artifact pre-loader:
//! when a container that executed an inference function goes idle, the
//! invoker may ask it to load additional models into process memory, so that
//! a *different* inference function routed there later finds its model
//! already resident and skips the loading tail latency.
//!
//! ## Architecture
//!
//! ```text
//! ActivationMessage → Container Pool ──┬─→ Container Proxy → Container
//!                        │             ├─→ Container Proxy → Container
//!                        │             └─→ Container Proxy → Container
//!                        │
//!                        ├─ schedule(): warm / warming / pre-load hit / cold
//!                        ├─ pre-load planner (bin packing by saved latency)
//!                        ├─ prewarm management (static + reactive)
//!                        └─ fleet state publisher (busy pool, pre-load table)
//! ```
//!
//! Pool and proxies are single-mailbox actors; every container I/O completion
//! is delivered back as a message, so no handler ever blocks.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use icebreaker::{Invoker, config::InvokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> icebreaker::Result<()> {
//!     let config = InvokerConfig::from_file("invoker.toml").await?;
//!     let invoker = Invoker::new(config, services)?;
//!     invoker.start()?;
//!     invoker.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod activation;
pub mod config;
pub mod container;
pub mod core;
pub mod error;
pub mod fleet;
pub mod invoker;
pub mod observability;

// Re-export main types
pub use error::{InvokerError, Result};
pub use invoker::{Invoker, InvokerServices};

use crate::observability::metrics::MetricsSnapshot;
use serde::{Deserialize, Serialize};

/// Invoker runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InvokerState {
    /// Invoker has been created but not yet started
    #[default]
    Created,
    /// Invoker is building its pool and background jobs
    Starting,
    /// Invoker is accepting and executing activations
    Running,
    /// Invoker is draining and shutting down
    Stopping,
    /// Invoker has fully stopped
    Stopped,
}

impl std::fmt::Display for InvokerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Invoker health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerHealth {
    /// Current invoker state
    pub state: InvokerState,
    /// Uptime in seconds since the invoker was created
    pub uptime_secs: u64,
    /// Point-in-time metrics
    pub metrics: MetricsSnapshot,
}
