//! Model catalog configuration — the inference models known at boot

use serde::{Deserialize, Serialize};

use crate::error::{InvokerError, Result};

/// One catalog entry: the model behind an inference action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Fully-qualified action name (namespace/action)
    pub action_name: String,

    /// Model identifier (e.g. "ResNet50")
    pub model_name: String,

    /// Resident size of libraries + weights (MB)
    pub model_size_mb: u64,

    /// Observed load latency when cold (milliseconds)
    pub model_loading_latency_ms: u64,

    /// Starting arrival rate λ (invocations per minute)
    #[serde(default)]
    pub initial_lambda: f64,
}

impl ModelConfig {
    /// Validate a catalog entry
    pub fn validate(&self) -> Result<()> {
        if self.action_name.is_empty() || self.model_name.is_empty() {
            return Err(InvokerError::Config(
                "model entries need both action_name and model_name".into(),
            ));
        }
        if self.model_size_mb == 0 {
            return Err(InvokerError::Config(format!(
                "model '{}' must have model_size_mb > 0",
                self.model_name
            )));
        }
        if self.initial_lambda < 0.0 {
            return Err(InvokerError::Config(format!(
                "model '{}' has a negative arrival rate",
                self.model_name
            )));
        }
        Ok(())
    }
}
