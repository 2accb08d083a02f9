//! Fleet state store connection settings

use serde::{Deserialize, Serialize};

/// Connection settings for the shared fleet state store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStoreConfig {
    /// Whether fleet state publication is enabled at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Store host
    #[serde(default = "default_host")]
    pub host: String,

    /// Store port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,

    /// Database index
    #[serde(default)]
    pub db: i64,

    /// Maximum connections in the client pool
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    /// Target idle connections kept in the pool
    #[serde(default = "default_idle_pool_size")]
    pub idle_pool_size: u32,

    /// Minimum connections kept open
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,

    /// Operation timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_max_pool_size() -> u32 {
    300
}

fn default_idle_pool_size() -> u32 {
    100
}

fn default_min_pool_size() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for FleetStoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            host: default_host(),
            port: default_port(),
            password: None,
            db: 0,
            max_pool_size: default_max_pool_size(),
            idle_pool_size: default_idle_pool_size(),
            min_pool_size: default_min_pool_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl FleetStoreConfig {
    /// Connection URL for the redis client
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}
