//! Shared invoker context — the process-wide collaborators threaded into the
//! pool and every proxy at construction.

use crate::config::InvokerConfig;
use crate::core::model_table::ModelTable;
use crate::core::windows::WindowRegistry;
use crate::fleet::FleetStatePublisher;
use crate::observability::metrics::InvokerMetrics;
use std::sync::Arc;

/// Process-wide invoker state
pub struct CoreContext {
    /// Invoker configuration
    pub config: InvokerConfig,
    /// Per-action scheduling windows
    pub windows: WindowRegistry,
    /// Inference model catalog
    pub models: ModelTable,
    /// Fleet state publisher
    pub fleet: Arc<FleetStatePublisher>,
    /// Invoker metrics
    pub metrics: Arc<InvokerMetrics>,
}

impl CoreContext {
    /// Build the context from configuration
    pub fn new(config: InvokerConfig) -> Arc<Self> {
        let windows = WindowRegistry::new(config.timers.unused_timeout_minutes);
        let models = ModelTable::new(&config.models);
        let fleet = Arc::new(FleetStatePublisher::new(
            config.fleet_store.clone(),
            config.invoker_id.clone(),
            config.host_ip.clone(),
        ));
        Arc::new(Self {
            config,
            windows,
            models,
            fleet,
            metrics: Arc::new(InvokerMetrics::new()),
        })
    }
}
