//! Prewarming configuration — static stem-cell counts plus an optional
//! reactive policy driven by the cold-start rate.

use serde::{Deserialize, Serialize};

use crate::error::{InvokerError, Result};

/// One prewarming shape: how many stem cells of (kind, memory) to keep warm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrewarmingConfig {
    /// Runtime kind this shape serves (e.g. "python:3")
    pub kind: String,

    /// Stem-cell image; defaults to the kind's standard runtime image name
    #[serde(default)]
    pub image: Option<String>,

    /// Memory per stem cell (MB)
    pub memory_mb: u64,

    /// Number of stem cells started at boot
    #[serde(default = "default_initial_count")]
    pub initial_count: u32,

    /// Time-to-live of a stem cell (minutes); absent = no expiry
    #[serde(default)]
    pub ttl_minutes: Option<u64>,

    /// Reactive sizing; when present the desired count follows the
    /// cold-start rate instead of staying at `initial_count`
    #[serde(default)]
    pub reactive: Option<ReactivePrewarmingConfig>,
}

fn default_initial_count() -> u32 {
    1
}

/// Reactive prewarming policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactivePrewarmingConfig {
    /// Lower bound on the desired stem-cell count
    #[serde(default)]
    pub min_count: u32,

    /// Upper bound on the desired stem-cell count
    #[serde(default = "default_max_count")]
    pub max_count: u32,

    /// Cold starts per check interval that justify one increment
    #[serde(default = "default_threshold")]
    pub threshold: u64,

    /// Stem cells added per threshold crossing
    #[serde(default = "default_increment")]
    pub increment: u32,
}

fn default_max_count() -> u32 {
    4
}

fn default_threshold() -> u64 {
    1
}

fn default_increment() -> u32 {
    1
}

impl PrewarmingConfig {
    /// Image used for stem cells of this shape
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("action-{}", self.kind.replace([':', '/'], "-")))
    }

    /// Validate a single shape
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(InvokerError::Config("prewarm kind cannot be empty".into()));
        }
        if self.memory_mb == 0 {
            return Err(InvokerError::Config(format!(
                "prewarm shape '{}' must have memory_mb > 0",
                self.kind
            )));
        }
        if let Some(reactive) = &self.reactive {
            if reactive.min_count > reactive.max_count {
                return Err(InvokerError::Config(format!(
                    "prewarm shape '{}': min_count {} > max_count {}",
                    self.kind, reactive.min_count, reactive.max_count
                )));
            }
            if reactive.threshold == 0 {
                return Err(InvokerError::Config(format!(
                    "prewarm shape '{}': reactive threshold must be > 0",
                    self.kind
                )));
            }
        }
        Ok(())
    }

    /// Desired stem-cell count on a scheduled tick, given the cold starts
    /// observed since the previous tick.
    ///
    /// Without a reactive policy the shape holds at `initial_count`; with one,
    /// `clamp(min, ⌊cold_starts / threshold⌋ · increment, max)`.
    pub fn desired_count(&self, cold_starts: u64) -> u32 {
        match &self.reactive {
            None => self.initial_count,
            Some(r) => {
                let scaled = (cold_starts / r.threshold) as u32 * r.increment;
                scaled.clamp(r.min_count, r.max_count)
            }
        }
    }

    /// Desired stem-cell count when backfilling after an expired removal
    pub fn backfill_count(&self) -> u32 {
        match &self.reactive {
            None => self.initial_count,
            Some(r) => r.min_count.max(self.initial_count),
        }
    }
}
