//! Invoker façade — wires configuration, context, pool and boundary
//! collaborators into a single manageable unit.

use crate::activation::ack::AckSender;
use crate::activation::logs::LogCollector;
use crate::activation::store::ActivationStore;
use crate::activation::ActivationMessage;
use crate::container::ContainerFactory;
use crate::core::context::CoreContext;
use crate::core::pool::{ActivationFeed, ContainerPool, PoolHandle, PoolMsg, PoolOptions};
use crate::core::proxy::ProxyDeps;
use crate::config::InvokerConfig;
use crate::error::Result;
use crate::{InvokerHealth, InvokerState};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// External collaborators handed to the invoker at construction
pub struct InvokerServices {
    /// Container factory
    pub factory: Arc<dyn ContainerFactory>,
    /// Acknowledgement sender
    pub ack: Arc<dyn AckSender>,
    /// Activation record store
    pub store: Arc<dyn ActivationStore>,
    /// Log collector
    pub logs: Arc<dyn LogCollector>,
    /// Activation feed
    pub feed: Arc<dyn ActivationFeed>,
    /// Pool options
    pub options: PoolOptions,
}

/// The invoker — one per worker host
pub struct Invoker {
    ctx: Arc<CoreContext>,
    services: InvokerServices,
    state: Arc<RwLock<InvokerState>>,
    start_time: Instant,
    pool: RwLock<Option<PoolHandle>>,
}

impl Invoker {
    /// Create a new invoker from configuration and collaborators
    pub fn new(config: InvokerConfig, services: InvokerServices) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx: CoreContext::new(config),
            services,
            state: Arc::new(RwLock::new(InvokerState::Created)),
            start_time: Instant::now(),
            pool: RwLock::new(None),
        })
    }

    /// Start the pool and its background jobs
    pub fn start(&self) -> Result<()> {
        self.set_state(InvokerState::Starting);

        let deps = Arc::new(ProxyDeps {
            factory: self.services.factory.clone(),
            ack: self.services.ack.clone(),
            store: self.services.store.clone(),
            logs: self.services.logs.clone(),
        });
        let handle = ContainerPool::spawn(
            self.ctx.clone(),
            deps,
            self.services.feed.clone(),
            self.services.options.clone(),
        );
        *self.pool.write().unwrap() = Some(handle);

        self.set_state(InvokerState::Running);
        tracing::info!(
            invoker_id = %self.ctx.config.invoker_id,
            memory_mb = self.ctx.config.user_memory_mb,
            models = self.ctx.config.models.len(),
            "Invoker is running"
        );
        Ok(())
    }

    /// Submit one activation; false when the invoker is not running
    pub fn submit(&self, msg: ActivationMessage) -> bool {
        match self.pool.read().unwrap().as_ref() {
            Some(pool) => pool.submit(msg),
            None => false,
        }
    }

    /// Initiate shutdown
    pub fn shutdown(&self) {
        self.set_state(InvokerState::Stopping);
        if let Some(pool) = self.pool.write().unwrap().take() {
            pool.send(PoolMsg::Shutdown);
        }
        self.set_state(InvokerState::Stopped);
        tracing::info!("Invoker stopped");
    }

    /// Wait for Ctrl+C, then shut down
    pub async fn wait_for_shutdown(&self) {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        self.shutdown();
    }

    /// Current state
    pub fn state(&self) -> InvokerState {
        *self.state.read().unwrap()
    }

    /// Health snapshot
    pub fn health(&self) -> InvokerHealth {
        InvokerHealth {
            state: self.state(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            metrics: self.ctx.metrics.snapshot(),
        }
    }

    /// Whether the invoker is accepting work
    pub fn is_running(&self) -> bool {
        self.state() == InvokerState::Running
    }

    fn set_state(&self, new_state: InvokerState) {
        let mut state = self.state.write().unwrap();
        tracing::debug!(from = %*state, to = %new_state, "State transition");
        *state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ack::MockAckSender;
    use crate::activation::logs::MockLogCollector;
    use crate::activation::store::MockActivationStore;
    use crate::config::FleetStoreConfig;
    use crate::container::mock::MockContainerFactory;
    use crate::core::pool::NoopFeed;

    fn services() -> InvokerServices {
        InvokerServices {
            factory: Arc::new(MockContainerFactory::new()),
            ack: Arc::new(MockAckSender::new()),
            store: Arc::new(MockActivationStore::new()),
            logs: Arc::new(MockLogCollector::default()),
            feed: Arc::new(NoopFeed),
            options: PoolOptions {
                health_probes_enabled: false,
            },
        }
    }

    fn config() -> InvokerConfig {
        InvokerConfig {
            fleet_store: FleetStoreConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let invoker = Invoker::new(config(), services()).unwrap();
        assert_eq!(invoker.state(), InvokerState::Created);
        assert!(!invoker.is_running());

        invoker.start().unwrap();
        assert!(invoker.is_running());
        assert_eq!(invoker.health().state, InvokerState::Running);

        invoker.shutdown();
        assert_eq!(invoker.state(), InvokerState::Stopped);
    }

    #[tokio::test]
    async fn test_submit_requires_running_pool() {
        let invoker = Invoker::new(config(), services()).unwrap();
        let msg = crate::activation::ActivationMessage {
            transaction_id: "tid".into(),
            activation_id: "a1".into(),
            action: crate::activation::ActionRef {
                namespace: "guest".into(),
                name: "fn".into(),
                revision: "1".into(),
                exec: crate::activation::ExecSpec {
                    kind: "python:3".into(),
                    image: "img".into(),
                    pull: false,
                    code: None,
                },
                limits: Default::default(),
            },
            user: crate::activation::UserContext {
                namespace: "guest".into(),
                uuid: "u".into(),
            },
            blocking: false,
            controller_index: 0,
            content: None,
            init_args: Vec::new(),
            locked_args: Default::default(),
            windows: Default::default(),
        };
        assert!(!invoker.submit(msg.clone()));

        invoker.start().unwrap();
        assert!(invoker.submit(msg));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = InvokerConfig {
            user_memory_mb: 0,
            ..Default::default()
        };
        assert!(Invoker::new(bad, services()).is_err());
    }
}
