//! Centralized error types for the icebreaker invoker

use thiserror::Error;

/// Invoker error types
#[derive(Debug, Error)]
pub enum InvokerError {
    /// Configuration file parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Container runtime could not start a container (platform fault)
    #[error("Container start failed: {0}")]
    ContainerStart(String),

    /// Container runtime rejected the user image (developer fault)
    #[error("Image error: {0}")]
    ImagePull(String),

    /// Container /init call failed
    #[error("Container initialization failed: {0}")]
    ContainerInit(String),

    /// Container /run call failed
    #[error("Container run failed: {0}")]
    ContainerRun(String),

    /// Container stopped responding to health probes
    #[error("Container health check failed: {0}")]
    ContainerHealth(String),

    /// Not enough memory left in the pool budget
    #[error("Memory exhausted: need {needed} MB, free {free} MB")]
    MemoryExhausted { needed: u64, free: u64 },

    /// HTTP request or response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Fleet state store error
    #[error("Fleet store error: {0}")]
    FleetStore(#[from] redis::RedisError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl InvokerError {
    /// Whether this error is attributable to the user's action (image, code)
    /// rather than the platform.
    pub fn is_developer_error(&self) -> bool {
        matches!(self, Self::ImagePull(_) | Self::ContainerInit(_))
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, InvokerError>;
