//! Invoker metrics — lightweight counters and gauges
//!
//! Tracks container start kinds and pool occupancy without external
//! dependencies; a snapshot can be exported as JSON.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// How a scheduling decision obtained its container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// Reused a warm container
    Warm,
    /// Reused a container that was still warming
    Warming,
    /// Hit a container with the model pre-loaded
    Preloaded,
    /// Took a prewarmed stem cell
    Prewarmed,
    /// Created a fresh container
    Cold,
    /// Created after evicting idle containers
    Recreated,
    /// Took a prewarm after evicting idle containers
    RecreatedPrewarm,
}

/// Metrics snapshot — a point-in-time view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Warm container reuses
    pub warm_starts: u64,
    /// Warming container reuses
    pub warming_starts: u64,
    /// Pre-load scheduling hits
    pub preload_hits: u64,
    /// Prewarm takes
    pub prewarm_starts: u64,
    /// Cold creations
    pub cold_starts: u64,
    /// Creations after eviction
    pub recreated_starts: u64,
    /// Prewarm takes after eviction
    pub recreated_prewarm_starts: u64,
    /// Activations currently buffered in the pool
    pub buffered_runs: usize,
    /// Activations currently executing
    pub active_activations: usize,
    /// Memory of busy containers (MB)
    pub active_mb: u64,
    /// Memory of idle warm containers (MB)
    pub idle_mb: u64,
    /// Memory of prewarmed containers (MB)
    pub prewarm_mb: u64,
}

/// Invoker metrics collector
pub struct InvokerMetrics {
    warm_starts: AtomicU64,
    warming_starts: AtomicU64,
    preload_hits: AtomicU64,
    prewarm_starts: AtomicU64,
    cold_starts: AtomicU64,
    recreated_starts: AtomicU64,
    recreated_prewarm_starts: AtomicU64,
    buffered_runs: AtomicUsize,
    active_activations: AtomicUsize,
    active_mb: AtomicU64,
    idle_mb: AtomicU64,
    prewarm_mb: AtomicU64,
}

impl InvokerMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            warm_starts: AtomicU64::new(0),
            warming_starts: AtomicU64::new(0),
            preload_hits: AtomicU64::new(0),
            prewarm_starts: AtomicU64::new(0),
            cold_starts: AtomicU64::new(0),
            recreated_starts: AtomicU64::new(0),
            recreated_prewarm_starts: AtomicU64::new(0),
            buffered_runs: AtomicUsize::new(0),
            active_activations: AtomicUsize::new(0),
            active_mb: AtomicU64::new(0),
            idle_mb: AtomicU64::new(0),
            prewarm_mb: AtomicU64::new(0),
        }
    }

    /// Record one scheduling decision
    pub fn record_start(&self, kind: StartKind) {
        let counter = match kind {
            StartKind::Warm => &self.warm_starts,
            StartKind::Warming => &self.warming_starts,
            StartKind::Preloaded => &self.preload_hits,
            StartKind::Prewarmed => &self.prewarm_starts,
            StartKind::Cold => &self.cold_starts,
            StartKind::Recreated => &self.recreated_starts,
            StartKind::RecreatedPrewarm => &self.recreated_prewarm_starts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the pool gauges
    pub fn set_pool_gauges(
        &self,
        buffered: usize,
        active: usize,
        active_mb: u64,
        idle_mb: u64,
        prewarm_mb: u64,
    ) {
        self.buffered_runs.store(buffered, Ordering::Relaxed);
        self.active_activations.store(active, Ordering::Relaxed);
        self.active_mb.store(active_mb, Ordering::Relaxed);
        self.idle_mb.store(idle_mb, Ordering::Relaxed);
        self.prewarm_mb.store(prewarm_mb, Ordering::Relaxed);
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            warm_starts: self.warm_starts.load(Ordering::Relaxed),
            warming_starts: self.warming_starts.load(Ordering::Relaxed),
            preload_hits: self.preload_hits.load(Ordering::Relaxed),
            prewarm_starts: self.prewarm_starts.load(Ordering::Relaxed),
            cold_starts: self.cold_starts.load(Ordering::Relaxed),
            recreated_starts: self.recreated_starts.load(Ordering::Relaxed),
            recreated_prewarm_starts: self.recreated_prewarm_starts.load(Ordering::Relaxed),
            buffered_runs: self.buffered_runs.load(Ordering::Relaxed),
            active_activations: self.active_activations.load(Ordering::Relaxed),
            active_mb: self.active_mb.load(Ordering::Relaxed),
            idle_mb: self.idle_mb.load(Ordering::Relaxed),
            prewarm_mb: self.prewarm_mb.load(Ordering::Relaxed),
        }
    }
}

impl Default for InvokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_start_kinds() {
        let metrics = InvokerMetrics::new();
        metrics.record_start(StartKind::Cold);
        metrics.record_start(StartKind::Cold);
        metrics.record_start(StartKind::Warm);
        metrics.record_start(StartKind::Preloaded);
        metrics.record_start(StartKind::RecreatedPrewarm);

        let snap = metrics.snapshot();
        assert_eq!(snap.cold_starts, 2);
        assert_eq!(snap.warm_starts, 1);
        assert_eq!(snap.preload_hits, 1);
        assert_eq!(snap.recreated_prewarm_starts, 1);
        assert_eq!(snap.warming_starts, 0);
    }

    #[test]
    fn test_pool_gauges() {
        let metrics = InvokerMetrics::new();
        metrics.set_pool_gauges(3, 5, 1280, 512, 256);
        let snap = metrics.snapshot();
        assert_eq!(snap.buffered_runs, 3);
        assert_eq!(snap.active_activations, 5);
        assert_eq!(snap.active_mb, 1280);
        assert_eq!(snap.idle_mb, 512);
        assert_eq!(snap.prewarm_mb, 256);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = InvokerMetrics::new();
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("cold_starts"));
    }
}
