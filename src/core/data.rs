//! Algebraic state of a managed container.
//!
//! One tagged variant per specialization level, each carrying its fields
//! explicitly; capacity and scheduling predicates are pattern matches rather
//! than virtual methods.

use crate::activation::ActionRef;
use std::time::Instant;

/// State data of a managed container
#[derive(Debug, Clone)]
pub enum ContainerData {
    /// Unstarted, no memory reserved
    NoData,
    /// Unstarted, memory reserved
    Memory {
        /// Reserved memory (MB)
        memory_mb: u64,
    },
    /// Started stem cell, not specialized
    PreWarmed {
        /// Runtime container id
        container_id: String,
        /// Runtime kind the stem cell was started for
        kind: String,
        /// Memory (MB)
        memory_mb: u64,
        /// Expiry deadline, when the shape has a TTL
        expires_at: Option<Instant>,
    },
    /// Specializing: container exists, /init in flight
    Warming {
        /// Runtime container id
        container_id: String,
        /// Action being initialized
        action: ActionRef,
        /// Last scheduling decision that touched this container
        last_used: Instant,
        /// Activations admitted (including the one initializing)
        active: u32,
    },
    /// Specializing from cold: container creation still in flight
    WarmingCold {
        /// Action being initialized
        action: ActionRef,
        /// Last scheduling decision that touched this container
        last_used: Instant,
        /// Activations admitted
        active: u32,
    },
    /// Specialized and reusable for its action
    Warmed {
        /// Runtime container id
        container_id: String,
        /// Action the container is specialized for
        action: ActionRef,
        /// End of the most recent activation
        last_used: Instant,
        /// Activations currently in flight
        active: u32,
    },
}

impl ContainerData {
    /// Whether another activation may be admitted
    pub fn has_capacity(&self) -> bool {
        match self {
            Self::NoData | Self::Memory { .. } => true,
            Self::PreWarmed { .. } => false,
            Self::Warming { action, active, .. }
            | Self::WarmingCold { action, active, .. }
            | Self::Warmed { action, active, .. } => *active < action.limits.max_concurrent,
        }
    }

    /// Memory the container occupies in the pool budget (MB)
    pub fn memory_mb(&self) -> u64 {
        match self {
            Self::NoData => 0,
            Self::Memory { memory_mb } | Self::PreWarmed { memory_mb, .. } => *memory_mb,
            Self::Warming { action, .. }
            | Self::WarmingCold { action, .. }
            | Self::Warmed { action, .. } => action.limits.memory_mb,
        }
    }

    /// In-flight activation count
    pub fn active(&self) -> u32 {
        match self {
            Self::Warming { active, .. }
            | Self::WarmingCold { active, .. }
            | Self::Warmed { active, .. } => *active,
            _ => 0,
        }
    }

    /// Timestamp of the last use, when the variant tracks one
    pub fn last_used(&self) -> Option<Instant> {
        match self {
            Self::Warming { last_used, .. }
            | Self::WarmingCold { last_used, .. }
            | Self::Warmed { last_used, .. } => Some(*last_used),
            _ => None,
        }
    }

    /// Action the container is (being) specialized for
    pub fn action(&self) -> Option<&ActionRef> {
        match self {
            Self::Warming { action, .. }
            | Self::WarmingCold { action, .. }
            | Self::Warmed { action, .. } => Some(action),
            _ => None,
        }
    }

    /// Runtime container id, when the container exists
    pub fn container_id(&self) -> Option<&str> {
        match self {
            Self::PreWarmed { container_id, .. }
            | Self::Warming { container_id, .. }
            | Self::Warmed { container_id, .. } => Some(container_id),
            _ => None,
        }
    }

    /// Whether this container is specialized (or specializing) for the action
    pub fn serves(&self, action_fqn: &str) -> bool {
        self.action().map(|a| a.fqn() == action_fqn).unwrap_or(false)
    }

    /// Whether the container is fully warm
    pub fn is_warmed(&self) -> bool {
        matches!(self, Self::Warmed { .. })
    }

    /// Copy with one more admitted activation (no-op for inactive variants)
    pub fn incremented(&self) -> Self {
        let mut data = self.clone();
        match &mut data {
            Self::Warming { active, .. }
            | Self::WarmingCold { active, .. }
            | Self::Warmed { active, .. } => *active += 1,
            _ => {}
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActionLimits, ExecSpec};

    fn action(max_concurrent: u32) -> ActionRef {
        ActionRef {
            namespace: "guest".into(),
            name: "fn".into(),
            revision: "1".into(),
            exec: ExecSpec {
                kind: "python:3".into(),
                image: "img".into(),
                pull: false,
                code: None,
            },
            limits: ActionLimits {
                memory_mb: 256,
                timeout_ms: 60_000,
                max_concurrent,
            },
        }
    }

    #[test]
    fn test_capacity_by_variant() {
        assert!(ContainerData::NoData.has_capacity());
        assert!(ContainerData::Memory { memory_mb: 256 }.has_capacity());
        assert!(!ContainerData::PreWarmed {
            container_id: "c".into(),
            kind: "python:3".into(),
            memory_mb: 256,
            expires_at: None,
        }
        .has_capacity());

        let warm = |active| ContainerData::Warmed {
            container_id: "c".into(),
            action: action(2),
            last_used: Instant::now(),
            active,
        };
        assert!(warm(0).has_capacity());
        assert!(warm(1).has_capacity());
        assert!(!warm(2).has_capacity());
    }

    #[test]
    fn test_memory_accounting() {
        assert_eq!(ContainerData::NoData.memory_mb(), 0);
        assert_eq!(ContainerData::Memory { memory_mb: 512 }.memory_mb(), 512);
        let warmed = ContainerData::Warmed {
            container_id: "c".into(),
            action: action(1),
            last_used: Instant::now(),
            active: 0,
        };
        assert_eq!(warmed.memory_mb(), 256);
    }

    #[test]
    fn test_serves_exact_action() {
        let warmed = ContainerData::Warmed {
            container_id: "c".into(),
            action: action(1),
            last_used: Instant::now(),
            active: 0,
        };
        assert!(warmed.serves("guest/fn"));
        assert!(!warmed.serves("guest/other"));
        assert!(!ContainerData::NoData.serves("guest/fn"));
    }
}
