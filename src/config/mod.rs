//! Configuration types for the icebreaker invoker
//!
//! One TOML file describes the whole invoker: identity, memory budget,
//! container factory, prewarming, the model catalog and the fleet store.

mod fleet;
mod models;
mod prewarm;

pub use fleet::FleetStoreConfig;
pub use models::ModelConfig;
pub use prewarm::{PrewarmingConfig, ReactivePrewarmingConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{InvokerError, Result};

/// Top-level invoker configuration
///
/// # Example
///
/// ```toml
/// invoker_id = "invoker0"
/// host_ip = "10.4.0.7"
/// user_memory_mb = 8192
///
/// [container_factory]
/// docker_host = "/var/run/docker.sock"
///
/// [[prewarm]]
/// kind = "python:3"
/// memory_mb = 256
/// initial_count = 2
///
/// [[models]]
/// action_name = "guest/ptest04"
/// model_name = "ResNet50"
/// model_size_mb = 98
/// model_loading_latency_ms = 4200
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Identity of this invoker within the fleet
    #[serde(default = "default_invoker_id")]
    pub invoker_id: String,

    /// Address published to the fleet store for controller-side routing
    #[serde(default = "default_host_ip")]
    pub host_ip: String,

    /// Memory budget shared by all pools and starting prewarms (MB)
    #[serde(default = "default_user_memory_mb")]
    pub user_memory_mb: u64,

    /// Container factory settings
    #[serde(default)]
    pub container_factory: ContainerFactoryConfig,

    /// Static prewarming configuration, one entry per (kind, memory) shape
    #[serde(default)]
    pub prewarm: Vec<PrewarmingConfig>,

    /// Fleet state store connection
    #[serde(default)]
    pub fleet_store: FleetStoreConfig,

    /// Known inference models, keyed by owning action
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Timer settings
    #[serde(default)]
    pub timers: TimerConfig,

    /// Container health probe settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Base URL of the controller completion API
    #[serde(default = "default_controller_url")]
    pub controller_url: String,

    /// Base URL of the activation record store
    #[serde(default = "default_store_url")]
    pub activation_store_url: String,

    /// Maximum log lines collected per activation
    #[serde(default = "default_log_limit")]
    pub log_limit: usize,
}

fn default_invoker_id() -> String {
    "invoker0".to_string()
}

fn default_host_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_user_memory_mb() -> u64 {
    8192
}

fn default_controller_url() -> String {
    "http://localhost:10001".to_string()
}

fn default_store_url() -> String {
    "http://localhost:5984/whisk_activations".to_string()
}

fn default_log_limit() -> usize {
    1000
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            invoker_id: default_invoker_id(),
            host_ip: default_host_ip(),
            user_memory_mb: default_user_memory_mb(),
            container_factory: ContainerFactoryConfig::default(),
            prewarm: Vec::new(),
            fleet_store: FleetStoreConfig::default(),
            models: Vec::new(),
            timers: TimerConfig::default(),
            health: HealthConfig::default(),
            controller_url: default_controller_url(),
            activation_store_url: default_store_url(),
            log_limit: default_log_limit(),
        }
    }
}

impl InvokerConfig {
    /// Load configuration from a TOML file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: InvokerConfig = toml::from_str(&raw)
            .map_err(|e| InvokerError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.invoker_id.is_empty() {
            return Err(InvokerError::Config("invoker_id cannot be empty".into()));
        }
        if self.user_memory_mb == 0 {
            return Err(InvokerError::Config("user_memory_mb must be > 0".into()));
        }
        for p in &self.prewarm {
            p.validate()?;
            if p.memory_mb > self.user_memory_mb {
                return Err(InvokerError::Config(format!(
                    "prewarm shape '{}' ({} MB) exceeds the user memory budget",
                    p.kind, p.memory_mb
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for m in &self.models {
            m.validate()?;
            if !seen.insert(&m.action_name) {
                return Err(InvokerError::Config(format!(
                    "duplicate model entry for action '{}'",
                    m.action_name
                )));
            }
        }
        Ok(())
    }
}

/// Container factory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerFactoryConfig {
    /// Docker daemon address: a Unix socket path or a `tcp://host:port` URL
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// Docker network containers are attached to
    #[serde(default = "default_network")]
    pub network: String,

    /// CPU shares per container (0 = runtime default)
    #[serde(default)]
    pub cpu_shares: u32,
}

fn default_docker_host() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_network() -> String {
    "bridge".to_string()
}

impl Default for ContainerFactoryConfig {
    fn default() -> Self {
        Self {
            docker_host: default_docker_host(),
            network: default_network(),
            cpu_shares: 0,
        }
    }
}

/// Timer settings for the pool and proxies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Default keep-alive (minutes) for proxies created before any activation
    /// supplied a per-function value
    #[serde(default = "default_unused_timeout_minutes")]
    pub unused_timeout_minutes: u64,

    /// Base interval of the prewarm expiration check (seconds)
    #[serde(default = "default_prewarm_check_secs")]
    pub prewarm_expiration_check_secs: u64,

    /// Random variance added to the prewarm check interval (seconds)
    #[serde(default = "default_prewarm_check_variance_secs")]
    pub prewarm_expiration_check_variance_secs: u64,

    /// Minimum interval between "pool is full" warnings (seconds)
    #[serde(default = "default_buffer_warn_secs")]
    pub buffer_warning_interval_secs: u64,
}

fn default_unused_timeout_minutes() -> u64 {
    10
}

fn default_prewarm_check_secs() -> u64 {
    60
}

fn default_prewarm_check_variance_secs() -> u64 {
    10
}

fn default_buffer_warn_secs() -> u64 {
    60
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            unused_timeout_minutes: default_unused_timeout_minutes(),
            prewarm_expiration_check_secs: default_prewarm_check_secs(),
            prewarm_expiration_check_variance_secs: default_prewarm_check_variance_secs(),
            buffer_warning_interval_secs: default_buffer_warn_secs(),
        }
    }
}

/// Container health probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Time between TCP pings (milliseconds)
    #[serde(default = "default_check_period_ms")]
    pub check_period_ms: u64,

    /// Connect timeout per ping (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Consecutive failures before a container is declared unhealthy
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
}

fn default_check_period_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    200
}

fn default_max_fails() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_period_ms: default_check_period_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_fails: default_max_fails(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(InvokerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_invoker_id_rejected() {
        let config = InvokerConfig {
            invoker_id: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_memory_rejected() {
        let config = InvokerConfig {
            user_memory_mb: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_prewarm_rejected() {
        let config = InvokerConfig {
            user_memory_mb: 512,
            prewarm: vec![PrewarmingConfig {
                kind: "python:3".into(),
                image: None,
                memory_mb: 1024,
                initial_count: 1,
                ttl_minutes: None,
                reactive: None,
            }],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds the user memory budget"));
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let model = ModelConfig {
            action_name: "guest/ptest04".into(),
            model_name: "ResNet50".into(),
            model_size_mb: 98,
            model_loading_latency_ms: 4200,
            initial_lambda: 0.0,
        };
        let config = InvokerConfig {
            models: vec![model.clone(), model],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate model entry"));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let raw = r#"
            invoker_id = "invoker3"
            user_memory_mb = 2048

            [container_factory]
            docker_host = "tcp://localhost:2375"

            [[prewarm]]
            kind = "python:3"
            memory_mb = 256
            initial_count = 2

            [[models]]
            action_name = "guest/ptest04"
            model_name = "ResNet50"
            model_size_mb = 98
            model_loading_latency_ms = 4200
        "#;
        let config: InvokerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.invoker_id, "invoker3");
        assert_eq!(config.user_memory_mb, 2048);
        assert_eq!(config.container_factory.docker_host, "tcp://localhost:2375");
        assert_eq!(config.prewarm.len(), 1);
        assert_eq!(config.models.len(), 1);
        assert!(config.validate().is_ok());
        // untouched sections keep their defaults
        assert_eq!(config.timers.unused_timeout_minutes, 10);
        assert_eq!(config.health.max_fails, 3);
    }
}
