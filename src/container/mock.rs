//! In-memory container implementations used by the unit and integration
//! tests. Behavior is scripted per factory: which call fails, how long runs
//! take, what the runtime returns.

use crate::activation::{epoch_ms, ActionRef, ActivationResponse, Interval, TransactionId};
use crate::container::{Container, ContainerFactory, RunOutput};
use crate::error::{InvokerError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted outcome for one container call
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Call succeeds; runs return a success response
    Ok,
    /// Run returns an application error document
    ApplicationError(String),
    /// Call fails with a health error (connection lost mid-run)
    HealthError,
    /// Call fails with a generic run error
    RunError(String),
}

/// A single mock container; records every call made against it
#[derive(Debug)]
pub struct MockContainer {
    id: String,
    addr: (String, u16),
    run_delay: Duration,
    /// Outcome script consumed by successive run calls; `Ok` once exhausted
    run_script: Mutex<VecDeque<MockOutcome>>,
    init_fails: bool,
    pub(crate) inits: AtomicUsize,
    pub(crate) runs: AtomicUsize,
    loads: Mutex<Vec<String>>,
    offloads: Mutex<Vec<String>>,
    destroys: AtomicUsize,
}

impl MockContainer {
    fn new(id: String, init_fails: bool, run_delay: Duration, script: VecDeque<MockOutcome>) -> Self {
        Self {
            id,
            // Port 1 is reserved and never listening, so real TCP health
            // probes against mock containers fail deterministically
            addr: ("127.0.0.1".into(), 1),
            run_delay,
            run_script: Mutex::new(script),
            init_fails,
            inits: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            loads: Mutex::new(Vec::new()),
            offloads: Mutex::new(Vec::new()),
            destroys: AtomicUsize::new(0),
        }
    }

    /// Number of /init calls observed
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    /// Number of /run calls observed
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Number of destroy calls observed
    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Action names passed to /load, in call order
    pub fn loaded(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }

    /// Action names passed to /offload, in call order
    pub fn offloaded(&self) -> Vec<String> {
        self.offloads.lock().unwrap().clone()
    }
}

fn action_name_of(params: &serde_json::Value) -> String {
    params
        .get("action")
        .and_then(|v| v.as_str())
        .unwrap_or("?")
        .to_string()
}

#[async_trait]
impl Container for MockContainer {
    fn container_id(&self) -> &str {
        &self.id
    }

    fn addr(&self) -> (String, u16) {
        self.addr.clone()
    }

    async fn initialize(
        &self,
        _init_body: serde_json::Value,
        _timeout: Duration,
        _max_concurrent: u32,
    ) -> Result<Interval> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.init_fails {
            return Err(InvokerError::ContainerInit("handler failed to load".into()));
        }
        Ok(Interval::now())
    }

    async fn run(
        &self,
        _params: serde_json::Value,
        _env: serde_json::Value,
        _timeout: Duration,
        _max_concurrent: u32,
        _reschedule: bool,
    ) -> Result<RunOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .run_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockOutcome::Ok);

        let start = epoch_ms();
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        let interval = Interval {
            start_ms: start,
            end_ms: epoch_ms(),
        };

        match outcome {
            MockOutcome::Ok => Ok(RunOutput {
                interval,
                response: ActivationResponse::Success {
                    result: Some(serde_json::json!({"ok": true})),
                },
                timed_out: false,
            }),
            MockOutcome::ApplicationError(msg) => Ok(RunOutput {
                interval,
                response: ActivationResponse::ApplicationError {
                    error: serde_json::json!({ "error": msg }),
                },
                timed_out: false,
            }),
            MockOutcome::HealthError => {
                Err(InvokerError::ContainerHealth("connection reset".into()))
            }
            MockOutcome::RunError(msg) => Err(InvokerError::ContainerRun(msg)),
        }
    }

    async fn load(
        &self,
        params: serde_json::Value,
        _env: serde_json::Value,
        _timeout: Duration,
        _max_concurrent: u32,
    ) -> Result<()> {
        self.loads.lock().unwrap().push(action_name_of(&params));
        Ok(())
    }

    async fn offload(
        &self,
        params: serde_json::Value,
        _env: serde_json::Value,
        _timeout: Duration,
        _max_concurrent: u32,
    ) -> Result<()> {
        self.offloads.lock().unwrap().push(action_name_of(&params));
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How the next factory call should behave
#[derive(Debug, Clone)]
pub enum FactoryBehavior {
    /// Create a working container
    Ok,
    /// Fail with a platform error
    WhiskError,
    /// Fail with an image (developer) error
    DeveloperError,
}

/// Mock container factory; scripts creation behavior and keeps every
/// container it handed out for later inspection
pub struct MockContainerFactory {
    seq: AtomicU64,
    behaviors: Mutex<VecDeque<FactoryBehavior>>,
    init_fails: bool,
    run_delay: Mutex<Duration>,
    run_script: Mutex<VecDeque<MockOutcome>>,
    containers: Mutex<Vec<Arc<MockContainer>>>,
}

impl Default for MockContainerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerFactory {
    /// Factory whose containers always succeed
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            behaviors: Mutex::new(VecDeque::new()),
            init_fails: false,
            run_delay: Mutex::new(Duration::ZERO),
            run_script: Mutex::new(VecDeque::new()),
            containers: Mutex::new(Vec::new()),
        }
    }

    /// Factory whose containers fail /init
    pub fn with_failing_init() -> Self {
        Self {
            init_fails: true,
            ..Self::new()
        }
    }

    /// Queue a behavior for the next create call
    pub fn push_behavior(&self, behavior: FactoryBehavior) {
        self.behaviors.lock().unwrap().push_back(behavior);
    }

    /// Queue an outcome for the next run on the next created container
    pub fn push_run_outcome(&self, outcome: MockOutcome) {
        self.run_script.lock().unwrap().push_back(outcome);
    }

    /// Make every container's runs take this long
    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = delay;
    }

    /// Every container created so far, in creation order
    pub fn containers(&self) -> Vec<Arc<MockContainer>> {
        self.containers.lock().unwrap().clone()
    }

    /// Number of containers created
    pub fn created_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerFactory for MockContainerFactory {
    async fn create(
        &self,
        _tid: &TransactionId,
        name: &str,
        _image: &str,
        _pull: bool,
        _memory_mb: u64,
        _cpu_shares: u32,
        _action: Option<&ActionRef>,
    ) -> Result<Arc<dyn Container>> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FactoryBehavior::Ok);

        match behavior {
            FactoryBehavior::WhiskError => {
                Err(InvokerError::ContainerStart("no space left on device".into()))
            }
            FactoryBehavior::DeveloperError => {
                Err(InvokerError::ImagePull("manifest unknown".into()))
            }
            FactoryBehavior::Ok => {
                let n = self.seq.fetch_add(1, Ordering::SeqCst);
                let script = std::mem::take(&mut *self.run_script.lock().unwrap());
                let container = Arc::new(MockContainer::new(
                    format!("{}-{}", name, n),
                    self.init_fails,
                    *self.run_delay.lock().unwrap(),
                    script,
                ));
                self.containers.lock().unwrap().push(container.clone());
                Ok(container)
            }
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_creates_working_container() {
        let factory = MockContainerFactory::new();
        let c = factory
            .create(&"tid".to_string(), "wsk0", "img", false, 256, 0, None)
            .await
            .unwrap();

        let out = c
            .run(
                serde_json::json!({}),
                serde_json::json!({}),
                Duration::from_secs(1),
                1,
                false,
            )
            .await
            .unwrap();
        assert!(out.response.is_success());
        assert_eq!(factory.created_count(), 1);
        assert_eq!(factory.containers()[0].run_count(), 1);
    }

    #[tokio::test]
    async fn test_factory_scripts_failures() {
        let factory = MockContainerFactory::new();
        factory.push_behavior(FactoryBehavior::DeveloperError);
        let err = factory
            .create(&"tid".to_string(), "wsk0", "img", true, 256, 0, None)
            .await
            .unwrap_err();
        assert!(err.is_developer_error());

        factory.push_behavior(FactoryBehavior::WhiskError);
        let err = factory
            .create(&"tid".to_string(), "wsk1", "img", false, 256, 0, None)
            .await
            .unwrap_err();
        assert!(!err.is_developer_error());
    }

    #[tokio::test]
    async fn test_run_script_consumed_in_order() {
        let factory = MockContainerFactory::new();
        factory.push_run_outcome(MockOutcome::ApplicationError("bad input".into()));
        factory.push_run_outcome(MockOutcome::HealthError);
        let c = factory
            .create(&"tid".to_string(), "wsk0", "img", false, 256, 0, None)
            .await
            .unwrap();

        let out = c
            .run(
                serde_json::json!({}),
                serde_json::json!({}),
                Duration::from_secs(1),
                1,
                false,
            )
            .await
            .unwrap();
        assert!(!out.response.is_success());
        assert!(out.response.is_reusable());

        let err = c
            .run(
                serde_json::json!({}),
                serde_json::json!({}),
                Duration::from_secs(1),
                1,
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokerError::ContainerHealth(_)));

        // Script exhausted: back to success
        let out = c
            .run(
                serde_json::json!({}),
                serde_json::json!({}),
                Duration::from_secs(1),
                1,
                false,
            )
            .await
            .unwrap();
        assert!(out.response.is_success());
    }

    #[tokio::test]
    async fn test_load_offload_recorded() {
        let factory = MockContainerFactory::new();
        let c = factory
            .create(&"tid".to_string(), "wsk0", "img", false, 256, 0, None)
            .await
            .unwrap();
        c.load(
            serde_json::json!({"action": "guest/ptest05"}),
            serde_json::json!({}),
            Duration::from_secs(1),
            1,
        )
        .await
        .unwrap();
        c.offload(
            serde_json::json!({"action": "guest/ptest05"}),
            serde_json::json!({}),
            Duration::from_secs(1),
            1,
        )
        .await
        .unwrap();

        let mock = factory.containers()[0].clone();
        assert_eq!(mock.loaded(), vec!["guest/ptest05"]);
        assert_eq!(mock.offloaded(), vec!["guest/ptest05"]);
    }
}
