//! Container proxy — per-container state machine actor.
//!
//! Each proxy owns exactly one container and serializes all work against it.
//! Container I/O (create, init, run, load, offload, destroy) is spawned onto
//! worker tasks whose completions come back as self-addressed messages, so a
//! handler never blocks the mailbox.
//!
//! States: `Uninitialized → Starting → {Running, RunningToUser, Zygote,
//! Removing}`. `RunningToUser` is the idle-but-specialized keep-alive state;
//! `Zygote` is the extended-idle state in which the container may host
//! pre-loaded models for other actions.

use crate::activation::ack::send_ack_sequence;
use crate::activation::{
    epoch_ms, Activation, ActivationAnnotations, ActivationMessage, ActivationResponse, Interval,
};
use crate::container::health::{spawn_health_probe, HealthProbeConfig};
use crate::container::{Container, ContainerFactory, RunOutput};
use crate::core::context::CoreContext;
use crate::core::data::ContainerData;
use crate::core::pool::PoolMsg;
use crate::core::ProxyId;
use crate::error::InvokerError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Proxy lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// No container yet
    Uninitialized,
    /// Container creation (and possibly initialization) in flight
    Starting,
    /// At least one activation executing
    Running,
    /// Specialized and idle, within the keep-alive window
    RunningToUser,
    /// Extended idle; eligible to host foreign pre-loaded models
    Zygote,
    /// Container destroyed or being destroyed
    Removing,
}

/// Failure signal delivered to a proxy
#[derive(Debug, Clone)]
pub enum ContainerFailure {
    /// The container stopped answering health probes
    Health(String),
    /// Any other container-level failure
    Other(String),
}

/// Why a container is being created
#[derive(Debug, Clone)]
enum StartPurpose {
    /// Stem cell for the prewarm pool
    Prewarm {
        kind: String,
        memory_mb: u64,
        ttl: Option<Duration>,
    },
    /// Specialized container; runs `msg` after initialization when present
    Warmed { msg: Option<ActivationMessage> },
}

/// Outcome of one initialize-and-run cycle
#[derive(Debug)]
pub enum RunOutcome {
    /// An activation record was produced; container reusable iff `reusable`
    Completed {
        /// Whether the response allows further runs on this container
        reusable: bool,
    },
    /// Initialization failed; a synthetic activation was produced
    Aborted,
    /// The container went unhealthy mid-run; the message must be rerun
    Reschedule(Box<ActivationMessage>),
    /// The run failed for a non-health reason after producing an activation
    Failed,
}

/// Messages handled by a container proxy
pub enum ProxyMsg {
    /// Create a stem-cell container
    Start {
        /// Runtime kind
        kind: String,
        /// Stem-cell image
        image: String,
        /// Memory (MB)
        memory_mb: u64,
        /// Optional stem-cell TTL
        ttl: Option<Duration>,
    },
    /// Create and initialize a container for an action without running it
    CreateWarmed(Box<ActivationMessage>),
    /// Execute one activation
    Run(Box<ActivationMessage>),
    /// Load an additional model into the container (fire-and-forget)
    LoadModel(Box<ActivationMessage>),
    /// Drop a previously loaded model (fire-and-forget)
    OffloadModel(Box<ActivationMessage>),
    /// Destroy the container
    Remove,
    /// A container-level failure was detected
    Failure(ContainerFailure),

    // Self-addressed completions
    /// Container creation finished
    StartResult {
        /// Factory result
        result: std::result::Result<Arc<dyn Container>, InvokerError>,
        /// What the container was created for
        purpose: StartPurposeMsg,
    },
    /// /init succeeded; concurrent runs may proceed
    InitCompleted {
        /// Initialization interval
        interval: Interval,
    },
    /// Initialization-only cycle finished (CreateWarmed path)
    WarmCompleted {
        /// Whether /init succeeded
        ok: bool,
    },
    /// One run cycle finished
    RunCompleted {
        /// Outcome driving the state transition
        outcome: RunOutcome,
    },
}

/// Opaque start purpose carried through the self-message
pub struct StartPurposeMsg(StartPurpose);

/// External services a proxy needs
pub struct ProxyDeps {
    /// Container factory
    pub factory: Arc<dyn ContainerFactory>,
    /// Acknowledgement sender
    pub ack: Arc<dyn crate::activation::ack::AckSender>,
    /// Activation record store
    pub store: Arc<dyn crate::activation::store::ActivationStore>,
    /// Log collector
    pub logs: Arc<dyn crate::activation::logs::LogCollector>,
}

/// Proxy construction settings
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Idle time in `RunningToUser` before the zygote transition
    pub unused_timeout: Duration,
    /// Health probe settings
    pub health: HealthProbeConfig,
    /// Whether to spawn TCP health probes (disabled under mock factories)
    pub health_probes_enabled: bool,
}

/// Send handle to a proxy
#[derive(Clone)]
pub struct ProxyHandle {
    /// Proxy identity
    pub id: ProxyId,
    tx: mpsc::UnboundedSender<ProxyMsg>,
}

impl ProxyHandle {
    /// Deliver a message; returns false when the proxy is gone
    pub fn send(&self, msg: ProxyMsg) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// The proxy actor
pub struct ContainerProxy {
    id: ProxyId,
    ctx: Arc<CoreContext>,
    deps: Arc<ProxyDeps>,
    pool: mpsc::UnboundedSender<PoolMsg>,
    config: ProxyConfig,
    tx: mpsc::UnboundedSender<ProxyMsg>,

    state: ProxyState,
    data: ContainerData,
    container: Option<Arc<dyn Container>>,
    run_buffer: VecDeque<ActivationMessage>,
    active: u32,
    any_success: bool,
    pending_removal: bool,
    removed: bool,
    idle_deadline: Option<tokio::time::Instant>,
    probe: Option<tokio::task::JoinHandle<()>>,
}

impl ContainerProxy {
    /// Spawn a new proxy actor and return its handle
    pub fn spawn(
        id: ProxyId,
        ctx: Arc<CoreContext>,
        deps: Arc<ProxyDeps>,
        pool: mpsc::UnboundedSender<PoolMsg>,
        config: ProxyConfig,
    ) -> ProxyHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let proxy = ContainerProxy {
            id,
            ctx,
            deps,
            pool,
            config,
            tx: tx.clone(),
            state: ProxyState::Uninitialized,
            data: ContainerData::NoData,
            container: None,
            run_buffer: VecDeque::new(),
            active: 0,
            any_success: false,
            pending_removal: false,
            removed: false,
            idle_deadline: None,
            probe: None,
        };
        tokio::spawn(proxy.run_loop(rx));
        ProxyHandle { id, tx }
    }

    async fn run_loop(mut self, mut rx: mpsc::UnboundedReceiver<ProxyMsg>) {
        loop {
            let deadline = self.idle_deadline;
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(msg) => self.handle(msg).await,
                        None => break,
                    }
                }
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.on_idle_timeout().await;
                }
            }

            if self.removed && self.active == 0 {
                break;
            }
        }
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        tracing::debug!(proxy = %self.id, "Proxy terminated");
    }

    async fn handle(&mut self, msg: ProxyMsg) {
        match msg {
            ProxyMsg::Start {
                kind,
                image,
                memory_mb,
                ttl,
            } => self.on_start(kind, image, memory_mb, ttl),
            ProxyMsg::CreateWarmed(msg) => self.on_create_warmed(*msg),
            ProxyMsg::Run(msg) => self.on_run(*msg),
            ProxyMsg::LoadModel(msg) => self.on_load_model(*msg),
            ProxyMsg::OffloadModel(msg) => self.on_offload_model(*msg),
            ProxyMsg::Remove => self.on_remove().await,
            ProxyMsg::Failure(failure) => self.on_failure(failure).await,
            ProxyMsg::StartResult { result, purpose } => {
                self.on_start_result(result, purpose.0).await
            }
            ProxyMsg::InitCompleted { interval: _ } => self.on_init_completed(),
            ProxyMsg::WarmCompleted { ok } => self.on_warm_completed(ok).await,
            ProxyMsg::RunCompleted { outcome } => self.on_run_completed(outcome).await,
        }
    }

    // ── Creation paths ────────────────────────────────────────────────────────

    fn on_start(&mut self, kind: String, image: String, memory_mb: u64, ttl: Option<Duration>) {
        if self.state != ProxyState::Uninitialized {
            tracing::warn!(proxy = %self.id, state = ?self.state, "Start ignored");
            return;
        }
        self.state = ProxyState::Starting;
        self.data = ContainerData::Memory { memory_mb };
        self.spawn_create(
            format!("prewarm-{}-{}", sanitize_kind(&kind), self.id.0),
            image,
            false,
            memory_mb,
            StartPurpose::Prewarm {
                kind,
                memory_mb,
                ttl,
            },
        );
    }

    fn on_create_warmed(&mut self, msg: ActivationMessage) {
        if self.state != ProxyState::Uninitialized {
            tracing::warn!(proxy = %self.id, state = ?self.state, "CreateWarmed ignored");
            return;
        }
        self.state = ProxyState::Starting;
        self.data = ContainerData::WarmingCold {
            action: msg.action.clone(),
            last_used: Instant::now(),
            active: 0,
        };
        self.spawn_create(
            container_name(&msg, self.id),
            msg.action.exec.image.clone(),
            msg.action.exec.pull,
            msg.action.limits.memory_mb,
            StartPurpose::Warmed { msg: None },
        );
    }

    fn spawn_create(
        &self,
        name: String,
        image: String,
        pull: bool,
        memory_mb: u64,
        purpose: StartPurpose,
    ) {
        let factory = self.deps.factory.clone();
        let tx = self.tx.clone();
        let cpu_shares = self.ctx.config.container_factory.cpu_shares;
        let tid = match &purpose {
            StartPurpose::Warmed { msg: Some(m) } => m.transaction_id.clone(),
            _ => format!("proxy-{}-create", self.id.0),
        };
        tokio::spawn(async move {
            let result = factory
                .create(&tid, &name, &image, pull, memory_mb, cpu_shares, None)
                .await;
            let _ = tx.send(ProxyMsg::StartResult {
                result,
                purpose: StartPurposeMsg(purpose),
            });
        });
    }

    async fn on_start_result(
        &mut self,
        result: std::result::Result<Arc<dyn Container>, InvokerError>,
        purpose: StartPurpose,
    ) {
        let container = match result {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(proxy = %self.id, error = %e, "Container creation failed");
                // Every buffered (and the triggering) run gets a synthetic answer
                if let StartPurpose::Warmed { msg: Some(m) } = &purpose {
                    self.answer_synthetically(m.clone(), &e);
                }
                let buffered: Vec<_> = self.run_buffer.drain(..).collect();
                for m in buffered {
                    self.answer_synthetically(m, &e);
                }
                self.active = 0;
                self.finish_removal(true).await;
                return;
            }
        };

        if self.config.health_probes_enabled {
            self.probe = Some(spawn_health_probe(
                container.container_id().to_string(),
                container.addr(),
                self.config.health,
                self.tx.clone(),
            ));
        }
        self.container = Some(container.clone());

        match purpose {
            StartPurpose::Prewarm {
                kind,
                memory_mb,
                ttl,
            } => {
                self.data = ContainerData::PreWarmed {
                    container_id: container.container_id().to_string(),
                    kind,
                    memory_mb,
                    expires_at: ttl.map(|t| Instant::now() + t),
                };
                self.state = ProxyState::RunningToUser;
                self.idle_deadline = None;
                let _ = self.pool.send(PoolMsg::PrewarmCompleted {
                    proxy: self.id,
                    data: self.data.clone(),
                });
            }
            StartPurpose::Warmed { msg } => {
                let action = match (&msg, self.data.action()) {
                    (Some(m), _) => m.action.clone(),
                    (None, Some(a)) => a.clone(),
                    (None, None) => {
                        tracing::error!(proxy = %self.id, "Warmed start without an action");
                        self.finish_removal(false).await;
                        return;
                    }
                };
                self.data = ContainerData::Warming {
                    container_id: container.container_id().to_string(),
                    action: action.clone(),
                    last_used: Instant::now(),
                    active: self.active,
                };
                match msg {
                    Some(m) => self.spawn_run(m, false),
                    None => {
                        // CreateWarmed path: initialize only
                        let tx = self.tx.clone();
                        let timeout = Duration::from_millis(action.limits.timeout_ms);
                        let max_concurrent = action.limits.max_concurrent;
                        let body = init_body(&action);
                        tokio::spawn(async move {
                            let ok = container
                                .initialize(body, timeout, max_concurrent)
                                .await
                                .is_ok();
                            let _ = tx.send(ProxyMsg::WarmCompleted { ok });
                        });
                    }
                }
            }
        }
    }

    async fn on_warm_completed(&mut self, ok: bool) {
        if !ok {
            tracing::warn!(proxy = %self.id, "Warm-container initialization failed");
            self.destroy_container();
            self.finish_removal(false).await;
            return;
        }
        self.promote_to_warmed();
        self.state = ProxyState::RunningToUser;
        self.reset_idle_deadline();
        let _ = self.pool.send(PoolMsg::NeedWork {
            proxy: self.id,
            data: self.data.clone(),
        });
        self.flush_buffer();
    }

    // ── Run handling ──────────────────────────────────────────────────────────

    fn on_run(&mut self, msg: ActivationMessage) {
        match self.state {
            ProxyState::Uninitialized => {
                // Cold path: create + initialize + run
                self.state = ProxyState::Starting;
                self.active = 1;
                self.data = ContainerData::WarmingCold {
                    action: msg.action.clone(),
                    last_used: Instant::now(),
                    active: 1,
                };
                self.spawn_create(
                    container_name(&msg, self.id),
                    msg.action.exec.image.clone(),
                    msg.action.exec.pull,
                    msg.action.limits.memory_mb,
                    StartPurpose::Warmed { msg: Some(msg) },
                );
            }
            ProxyState::Starting => {
                // Container not callable yet; hold until warm
                self.run_buffer.push_back(msg);
            }
            ProxyState::RunningToUser => {
                self.active += 1;
                self.specialize_for(&msg);
                let already_warm = self.data.is_warmed();
                self.state = ProxyState::Running;
                self.idle_deadline = None;
                self.spawn_run(msg, already_warm);
            }
            ProxyState::Zygote => {
                // Tell the pool execution is starting on a shared container,
                // with the arrival rate implied by the idle gap
                let lambda = self
                    .data
                    .last_used()
                    .map(|t| rate_per_minute(t.elapsed()))
                    .unwrap_or(0.0);
                let _ = self.pool.send(PoolMsg::StartRun {
                    proxy: self.id,
                    data: self.data.clone(),
                    action_fqn: msg.action.fqn(),
                    lambda,
                });
                self.active += 1;
                self.specialize_for(&msg);
                let already_warm = self.data.is_warmed();
                self.state = ProxyState::Running;
                self.idle_deadline = None;
                self.spawn_run(msg, already_warm);
            }
            ProxyState::Running => {
                let cap = self
                    .data
                    .action()
                    .map(|a| a.limits.max_concurrent)
                    .unwrap_or(1);
                if self.active < cap {
                    self.active += 1;
                    let already_warm = self.data.is_warmed();
                    self.spawn_run(msg, already_warm);
                } else {
                    self.run_buffer.push_back(msg);
                }
            }
            ProxyState::Removing => {
                // Bounce back to the pool for rescheduling elsewhere
                let _ = self.pool.send(PoolMsg::Reschedule {
                    proxy: self.id,
                    msg: Box::new(msg),
                });
            }
        }
    }

    fn spawn_run(&mut self, msg: ActivationMessage, already_warm: bool) {
        let Some(container) = self.container.clone() else {
            self.run_buffer.push_back(msg);
            return;
        };
        let deps = self.deps.clone();
        let tx = self.tx.clone();
        let admitted = Instant::now();
        tokio::spawn(async move {
            let outcome = initialize_and_run(container, deps, msg, already_warm, admitted, tx.clone()).await;
            let _ = tx.send(ProxyMsg::RunCompleted { outcome });
        });
    }

    fn on_init_completed(&mut self) {
        // First /init done: later runs on this container skip initialization
        // and buffered concurrent runs may proceed
        self.promote_to_warmed();
        self.flush_buffer();
    }

    async fn on_run_completed(&mut self, outcome: RunOutcome) {
        self.active = self.active.saturating_sub(1);

        match outcome {
            RunOutcome::Completed { reusable } => {
                if reusable {
                    self.any_success = true;
                    self.promote_to_warmed();
                    self.touch();
                    if self.state == ProxyState::Removing {
                        // A failure was handled while this run was in flight
                        return;
                    }

                    // A finished inference run is a pre-load opportunity for
                    // this function's own model
                    if let Some(action) = self.data.action() {
                        if self.ctx.models.is_inference_action(&action.fqn()) {
                            let _ = self.pool.send(PoolMsg::PreLoad {
                                action_fqn: action.fqn(),
                            });
                        }
                    }
                    let _ = self.pool.send(PoolMsg::NeedWork {
                        proxy: self.id,
                        data: self.data.clone(),
                    });

                    if self.pending_removal && self.active == 0 {
                        self.complete_removal().await;
                        return;
                    }
                    if self.active == 0 && self.run_buffer.is_empty() {
                        self.state = ProxyState::RunningToUser;
                        self.reset_idle_deadline();
                    }
                    self.flush_buffer();
                } else {
                    // Whisk-level failure; activation was answered
                    self.fail_container().await;
                }
            }
            RunOutcome::Aborted => {
                // Init failure: the triggering run was answered synthetically
                self.abort_or_resend_buffer();
                self.destroy_container();
                self.finish_removal(false).await;
            }
            RunOutcome::Reschedule(msg) => {
                let _ = self.pool.send(PoolMsg::Reschedule {
                    proxy: self.id,
                    msg,
                });
                self.fail_container().await;
            }
            RunOutcome::Failed => {
                self.fail_container().await;
            }
        }
    }

    // ── Pre-load / off-load signals ───────────────────────────────────────────

    fn on_load_model(&mut self, msg: ActivationMessage) {
        self.forward_model_signal(msg, true);
    }

    fn on_offload_model(&mut self, msg: ActivationMessage) {
        self.forward_model_signal(msg, false);
    }

    /// Fire-and-forget: never changes the proxy's own state; errors are logged
    fn forward_model_signal(&self, msg: ActivationMessage, load: bool) {
        let Some(container) = self.container.clone() else {
            tracing::warn!(proxy = %self.id, "Model signal for a container that is gone");
            return;
        };
        let needs_init = !self.data.is_warmed();
        let op = if load { "load" } else { "offload" };
        tokio::spawn(async move {
            let action = &msg.action;
            let timeout = Duration::from_millis(action.limits.timeout_ms);
            let max_concurrent = action.limits.max_concurrent;
            if needs_init {
                if let Err(e) = container
                    .initialize(init_body(action), timeout, max_concurrent)
                    .await
                {
                    tracing::warn!(op, action = %action.fqn(), error = %e, "Model signal init failed");
                    return;
                }
            }
            let params = model_signal_params(&msg);
            let env = run_env(&msg);
            let result = if load {
                container.load(params, env, timeout, max_concurrent).await
            } else {
                container.offload(params, env, timeout, max_concurrent).await
            };
            match result {
                Ok(()) => {
                    tracing::info!(op, action = %action.fqn(), container_id = %container.container_id(), "Model signal delivered")
                }
                Err(e) => tracing::warn!(op, action = %action.fqn(), error = %e, "Model signal failed"),
            }
        });
    }

    // ── Removal & failure ─────────────────────────────────────────────────────

    async fn on_remove(&mut self) {
        match self.state {
            ProxyState::Zygote => {
                let _ = self.pool.send(PoolMsg::OffLoadSignal {
                    proxy: self.id,
                    data: self.data.clone(),
                });
                self.destroy_container();
                self.finish_removal(false).await;
            }
            ProxyState::Removing => {}
            _ => {
                self.destroy_container();
                self.finish_removal(false).await;
            }
        }
    }

    async fn on_failure(&mut self, failure: ContainerFailure) {
        match failure {
            ContainerFailure::Health(reason) => {
                tracing::warn!(proxy = %self.id, reason = %reason, "Container unhealthy");
                // In-flight runs will fail on their own and be rescheduled;
                // buffered work goes back to the pool now
                self.resend_buffer_to_pool();
                self.destroy_container();
                self.finish_removal(false).await;
            }
            ContainerFailure::Other(reason) => {
                tracing::warn!(proxy = %self.id, reason = %reason, "Container failure");
                if self.active == 0 {
                    self.abort_or_resend_buffer();
                    self.destroy_container();
                    self.finish_removal(false).await;
                } else {
                    // Defer until in-flight runs drain
                    self.pending_removal = true;
                }
            }
        }
    }

    async fn on_idle_timeout(&mut self) {
        match self.state {
            ProxyState::RunningToUser => {
                tracing::debug!(proxy = %self.id, "Keep-alive expired, becoming zygote");
                self.state = ProxyState::Zygote;
                self.idle_deadline =
                    Some(tokio::time::Instant::now() + 2 * self.config.unused_timeout);
                let _ = self.pool.send(PoolMsg::ContainerIdle {
                    proxy: self.id,
                    data: self.data.clone(),
                });
            }
            ProxyState::Zygote => {
                tracing::debug!(proxy = %self.id, "Zygote expired, destroying");
                let _ = self.pool.send(PoolMsg::OffLoadSignal {
                    proxy: self.id,
                    data: self.data.clone(),
                });
                self.destroy_container();
                self.finish_removal(false).await;
            }
            _ => self.idle_deadline = None,
        }
    }

    /// Destroy after a run-level failure, deferring while runs are in flight
    async fn fail_container(&mut self) {
        if self.state == ProxyState::Removing {
            return;
        }
        if self.active == 0 {
            self.complete_removal().await;
        } else {
            self.pending_removal = true;
        }
    }

    async fn complete_removal(&mut self) {
        self.abort_or_resend_buffer();
        self.destroy_container();
        self.finish_removal(false).await;
    }

    async fn finish_removal(&mut self, replace_prewarm: bool) {
        if self.removed {
            return;
        }
        self.state = ProxyState::Removing;
        self.idle_deadline = None;
        self.removed = true;
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        let _ = self.pool.send(PoolMsg::ContainerRemoved {
            proxy: self.id,
            replace_prewarm,
        });
    }

    fn destroy_container(&mut self) {
        if let Some(container) = self.container.take() {
            tokio::spawn(async move {
                if let Err(e) = container.destroy().await {
                    tracing::warn!(container_id = %container.container_id(), error = %e, "Destroy failed");
                }
            });
        }
    }

    // ── Buffer discipline ─────────────────────────────────────────────────────

    fn flush_buffer(&mut self) {
        loop {
            let cap = self
                .data
                .action()
                .map(|a| a.limits.max_concurrent)
                .unwrap_or(1);
            if self.active >= cap {
                return;
            }
            let Some(msg) = self.run_buffer.pop_front() else {
                return;
            };
            self.active += 1;
            let already_warm = self.data.is_warmed();
            if self.state != ProxyState::Running {
                self.state = ProxyState::Running;
                self.idle_deadline = None;
            }
            self.spawn_run(msg, already_warm);
        }
    }

    /// Abort buffered runs when nothing ever succeeded here, resend otherwise
    fn abort_or_resend_buffer(&mut self) {
        if self.any_success {
            self.resend_buffer_to_pool();
        } else {
            let err = InvokerError::ContainerStart("container never became usable".into());
            let buffered: Vec<_> = self.run_buffer.drain(..).collect();
            for msg in buffered {
                self.answer_synthetically(msg, &err);
            }
        }
    }

    fn resend_buffer_to_pool(&mut self) {
        while let Some(msg) = self.run_buffer.pop_front() {
            let _ = self.pool.send(PoolMsg::Run(Box::new(msg)));
        }
    }

    /// Produce, persist and acknowledge a synthetic activation for a message
    /// that will never run here
    fn answer_synthetically(&self, msg: ActivationMessage, error: &InvokerError) {
        let response = if error.is_developer_error() {
            ActivationResponse::developer_error(error.to_string())
        } else {
            ActivationResponse::whisk_error(error.to_string())
        };
        let activation = Activation::synthetic(&msg, response);
        let deps = self.deps.clone();
        tokio::spawn(async move {
            record_activation(&deps, &msg, &activation).await;
        });
    }

    // ── Small helpers ─────────────────────────────────────────────────────────

    fn promote_to_warmed(&mut self) {
        let promoted = match &self.data {
            ContainerData::Warming {
                container_id,
                action,
                last_used,
                ..
            }
            | ContainerData::Warmed {
                container_id,
                action,
                last_used,
                ..
            } => Some(ContainerData::Warmed {
                container_id: container_id.clone(),
                action: action.clone(),
                last_used: *last_used,
                active: self.active,
            }),
            _ => None,
        };
        if let Some(data) = promoted {
            self.data = data;
        }
    }

    fn touch(&mut self) {
        let touched = match &self.data {
            ContainerData::Warmed {
                container_id,
                action,
                ..
            } => Some(ContainerData::Warmed {
                container_id: container_id.clone(),
                action: action.clone(),
                last_used: Instant::now(),
                active: self.active,
            }),
            _ => None,
        };
        if let Some(data) = touched {
            self.data = data;
        }
    }

    /// A stem cell receiving its first run becomes a warming container for
    /// that action
    fn specialize_for(&mut self, msg: &ActivationMessage) {
        if let ContainerData::PreWarmed { container_id, .. } = &self.data {
            self.data = ContainerData::Warming {
                container_id: container_id.clone(),
                action: msg.action.clone(),
                last_used: Instant::now(),
                active: self.active,
            };
        }
    }

    fn reset_idle_deadline(&mut self) {
        self.idle_deadline = match &self.data {
            ContainerData::Warmed { .. } if self.active == 0 => {
                Some(tokio::time::Instant::now() + self.config.unused_timeout)
            }
            _ => None,
        };
    }
}

// ── initialize-and-run ────────────────────────────────────────────────────────

/// One full activation cycle against a container.
///
/// (1) /init unless the container is already specialized, self-notifying
/// `InitCompleted` on success so concurrent runs proceed; (2) /run; (3) build
/// the activation record; (4) ack + persist, failures logged only; (5) collect
/// logs when configured; (6) classify the outcome.
async fn initialize_and_run(
    container: Arc<dyn Container>,
    deps: Arc<ProxyDeps>,
    msg: ActivationMessage,
    already_warm: bool,
    admitted: Instant,
    tx: mpsc::UnboundedSender<ProxyMsg>,
) -> RunOutcome {
    let action = msg.action.clone();
    let timeout = Duration::from_millis(action.limits.timeout_ms);
    let max_concurrent = action.limits.max_concurrent;

    let init_interval = if already_warm {
        None
    } else {
        match container
            .initialize(init_body(&action), timeout, max_concurrent)
            .await
        {
            Ok(interval) => {
                let _ = tx.send(ProxyMsg::InitCompleted { interval });
                Some(interval)
            }
            Err(e) => {
                tracing::warn!(activation = %msg.activation_id, error = %e, "Initialization failed");
                let response = ActivationResponse::developer_error(e.to_string());
                let mut activation = Activation::synthetic(&msg, response);
                activation.annotations.wait_time_ms = admitted.elapsed().as_millis() as u64;
                record_activation(&deps, &msg, &activation).await;
                return RunOutcome::Aborted;
            }
        }
    };

    let wait_time_ms = admitted.elapsed().as_millis() as u64;
    let run_result = container
        .run(
            run_params(&msg),
            run_env(&msg),
            timeout,
            max_concurrent,
            false,
        )
        .await;

    match run_result {
        Ok(output) => {
            let mut activation = build_activation(&msg, init_interval, &output, wait_time_ms);
            if deps.logs.logs_to_be_collected(&action) {
                match deps
                    .logs
                    .collect_logs(
                        &msg.transaction_id,
                        &msg.user,
                        &activation,
                        container.container_id(),
                        &action,
                    )
                    .await
                {
                    Ok(lines) => activation.logs = lines,
                    Err(e) => {
                        tracing::warn!(activation = %msg.activation_id, error = %e, "Log collection failed");
                        activation
                            .logs
                            .push(crate::activation::logs::LOG_COLLECTION_FAILED.to_string());
                    }
                }
            }
            record_activation(&deps, &msg, &activation).await;
            RunOutcome::Completed {
                reusable: output.response.is_reusable(),
            }
        }
        Err(InvokerError::ContainerHealth(reason)) => {
            tracing::warn!(activation = %msg.activation_id, reason = %reason, "Run hit an unhealthy container");
            RunOutcome::Reschedule(Box::new(msg))
        }
        Err(e) => {
            tracing::warn!(activation = %msg.activation_id, error = %e, "Run failed");
            let mut activation =
                Activation::synthetic(&msg, ActivationResponse::whisk_error(e.to_string()));
            activation.annotations.wait_time_ms = wait_time_ms;
            record_activation(&deps, &msg, &activation).await;
            RunOutcome::Failed
        }
    }
}

/// Ack and persist an activation; neither failure changes proxy state
async fn record_activation(deps: &ProxyDeps, msg: &ActivationMessage, activation: &Activation) {
    if let Err(e) = send_ack_sequence(
        deps.ack.as_ref(),
        &msg.transaction_id,
        activation,
        msg.blocking,
        msg.controller_index,
        &msg.user.uuid,
    )
    .await
    {
        tracing::warn!(activation = %activation.activation_id, error = %e, "Ack failed");
    }
    if let Err(e) = deps
        .store
        .store_activation(&msg.transaction_id, activation, msg.blocking, &msg.user)
        .await
    {
        tracing::warn!(activation = %activation.activation_id, error = %e, "Store failed");
    }
}

fn build_activation(
    msg: &ActivationMessage,
    init_interval: Option<Interval>,
    output: &RunOutput,
    wait_time_ms: u64,
) -> Activation {
    Activation {
        activation_id: msg.activation_id.clone(),
        namespace: msg.user.namespace.clone(),
        action_name: msg.action.fqn(),
        start_ms: output.interval.start_ms,
        end_ms: output.interval.end_ms,
        response: output.response.clone(),
        logs: Vec::new(),
        annotations: ActivationAnnotations {
            kind: msg.action.exec.kind.clone(),
            init_time_ms: init_interval.map(|i| i.duration_ms()),
            wait_time_ms,
            timeout: output.timed_out,
        },
    }
}

fn init_body(action: &crate::activation::ActionRef) -> serde_json::Value {
    serde_json::json!({
        "name": action.name,
        "kind": action.exec.kind,
        "code": action.exec.code,
    })
}

fn run_params(msg: &ActivationMessage) -> serde_json::Value {
    msg.content.clone().unwrap_or(serde_json::json!({}))
}

fn run_env(msg: &ActivationMessage) -> serde_json::Value {
    serde_json::json!({
        "activation_id": msg.activation_id,
        "transaction_id": msg.transaction_id,
        "namespace": msg.user.namespace,
        "action_name": msg.action.fqn(),
        "deadline": epoch_ms() + msg.action.limits.timeout_ms,
    })
}

fn model_signal_params(msg: &ActivationMessage) -> serde_json::Value {
    serde_json::json!({
        "action": msg.action.fqn(),
        "activation_id": msg.activation_id,
    })
}

fn container_name(msg: &ActivationMessage, id: ProxyId) -> String {
    format!(
        "wsk-{}-{}-{}",
        id.0,
        msg.user.namespace.replace('/', "-"),
        msg.action.name
    )
}

fn sanitize_kind(kind: &str) -> String {
    kind.replace([':', '/'], "-")
}

fn rate_per_minute(gap: Duration) -> f64 {
    let minutes = gap.as_secs_f64() / 60.0;
    if minutes <= f64::EPSILON {
        0.0
    } else {
        1.0 / minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ack::MockAckSender;
    use crate::activation::logs::MockLogCollector;
    use crate::activation::store::MockActivationStore;
    use crate::activation::{ActionLimits, ActionRef, ExecSpec, UserContext, WindowHints};
    use crate::config::{InvokerConfig, ModelConfig};
    use crate::container::mock::{FactoryBehavior, MockContainerFactory, MockOutcome};

    struct Harness {
        handle: ProxyHandle,
        pool_rx: mpsc::UnboundedReceiver<PoolMsg>,
        factory: Arc<MockContainerFactory>,
        ack: Arc<MockAckSender>,
        store: Arc<MockActivationStore>,
    }

    fn test_ctx() -> Arc<CoreContext> {
        let config = InvokerConfig {
            fleet_store: crate::config::FleetStoreConfig {
                enabled: false,
                ..Default::default()
            },
            models: vec![ModelConfig {
                action_name: "guest/ptest04".into(),
                model_name: "ResNet50".into(),
                model_size_mb: 98,
                model_loading_latency_ms: 4200,
                initial_lambda: 0.0,
            }],
            ..Default::default()
        };
        CoreContext::new(config)
    }

    fn harness_with(factory: MockContainerFactory, unused_timeout: Duration) -> Harness {
        let factory = Arc::new(factory);
        let ack = Arc::new(MockAckSender::new());
        let store = Arc::new(MockActivationStore::new());
        let deps = Arc::new(ProxyDeps {
            factory: factory.clone(),
            ack: ack.clone(),
            store: store.clone(),
            logs: Arc::new(MockLogCollector::with_lines(vec!["line".into()])),
        });
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let handle = ContainerProxy::spawn(
            ProxyId(1),
            test_ctx(),
            deps,
            pool_tx,
            ProxyConfig {
                unused_timeout,
                health: HealthProbeConfig::default(),
                health_probes_enabled: false,
            },
        );
        Harness {
            handle,
            pool_rx,
            factory,
            ack,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(MockContainerFactory::new(), Duration::from_secs(600))
    }

    fn message(action_name: &str, activation_id: &str, max_concurrent: u32) -> ActivationMessage {
        ActivationMessage {
            transaction_id: format!("tid-{}", activation_id),
            activation_id: activation_id.into(),
            action: ActionRef {
                namespace: "guest".into(),
                name: action_name.into(),
                revision: "1".into(),
                exec: ExecSpec {
                    kind: "python:3".into(),
                    image: "inference/python3ai".into(),
                    pull: false,
                    code: Some("ZGVm".into()),
                },
                limits: ActionLimits {
                    memory_mb: 256,
                    timeout_ms: 5_000,
                    max_concurrent,
                },
            },
            user: UserContext {
                namespace: "guest".into(),
                uuid: "u-1".into(),
            },
            blocking: false,
            controller_index: 0,
            content: None,
            init_args: Vec::new(),
            locked_args: Default::default(),
            windows: WindowHints::default(),
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<PoolMsg>) -> PoolMsg {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("pool message expected")
            .expect("pool channel open")
    }

    /// Like `recv`, but for paused-clock tests where auto-advance must be
    /// allowed to reach minute-scale proxy deadlines before the timeout
    async fn recv_eventually(rx: &mut mpsc::UnboundedReceiver<PoolMsg>) -> PoolMsg {
        tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("pool message expected")
            .expect("pool channel open")
    }

    #[tokio::test]
    async fn test_cold_run_produces_need_work_and_records() {
        let mut h = harness();
        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));

        let preload_or_needwork = recv(&mut h.pool_rx).await;
        // "fn" is not inference-eligible → no PreLoad, first message is NeedWork
        match preload_or_needwork {
            PoolMsg::NeedWork { data, .. } => {
                assert!(data.is_warmed());
                assert!(data.serves("guest/fn"));
            }
            other => panic!("expected NeedWork, got {:?}", std::mem::discriminant(&other)),
        }

        assert_eq!(h.factory.created_count(), 1);
        let container = h.factory.containers()[0].clone();
        assert_eq!(container.init_count(), 1);
        assert_eq!(container.run_count(), 1);

        // Exactly one record and one completion
        assert_eq!(h.store.count_for("a1"), 1);
        assert_eq!(h.ack.completions_for("a1"), 1);
        // Logs collected
        assert_eq!(h.store.records()[0].logs, vec!["line"]);
        // Cold run carries an init time
        assert!(h.store.records()[0].annotations.init_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_inference_run_emits_preload_before_need_work() {
        let mut h = harness();
        h.handle
            .send(ProxyMsg::Run(Box::new(message("ptest04", "a1", 1))));

        match recv(&mut h.pool_rx).await {
            PoolMsg::PreLoad { action_fqn } => assert_eq!(action_fqn, "guest/ptest04"),
            _ => panic!("expected PreLoad first"),
        }
        assert!(matches!(
            recv(&mut h.pool_rx).await,
            PoolMsg::NeedWork { .. }
        ));
    }

    #[tokio::test]
    async fn test_warm_reuse_skips_initialization() {
        let mut h = harness();
        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));
        assert!(matches!(
            recv(&mut h.pool_rx).await,
            PoolMsg::NeedWork { .. }
        ));

        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a2", 1))));
        assert!(matches!(
            recv(&mut h.pool_rx).await,
            PoolMsg::NeedWork { .. }
        ));

        assert_eq!(h.factory.created_count(), 1);
        let container = h.factory.containers()[0].clone();
        assert_eq!(container.init_count(), 1);
        assert_eq!(container.run_count(), 2);
        // Warm run has no init annotation
        assert!(h.store.records()[1].annotations.init_time_ms.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_runs_buffer_beyond_cap() {
        let factory = MockContainerFactory::new();
        factory.set_run_delay(Duration::from_millis(50));
        let mut h = harness_with(factory, Duration::from_secs(600));

        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));
        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a2", 1))));
        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a3", 1))));

        let mut need_work = 0;
        while need_work < 3 {
            if matches!(recv(&mut h.pool_rx).await, PoolMsg::NeedWork { .. }) {
                need_work += 1;
            }
        }

        // One container, three serialized runs
        assert_eq!(h.factory.created_count(), 1);
        assert_eq!(h.factory.containers()[0].run_count(), 3);
        assert_eq!(h.store.records().len(), 3);
        assert_eq!(h.ack.completions_for("a2"), 1);
    }

    #[tokio::test]
    async fn test_factory_failure_answers_synthetically_and_replaces_prewarm() {
        let factory = MockContainerFactory::new();
        factory.push_behavior(FactoryBehavior::WhiskError);
        let mut h = harness_with(factory, Duration::from_secs(600));

        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));

        match recv(&mut h.pool_rx).await {
            PoolMsg::ContainerRemoved {
                replace_prewarm, ..
            } => assert!(replace_prewarm),
            _ => panic!("expected ContainerRemoved"),
        }

        // The user still gets an answer
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.count_for("a1"), 1);
        assert!(!h.store.records()[0].response.is_reusable());
        assert_eq!(h.ack.completions_for("a1"), 1);
    }

    #[tokio::test]
    async fn test_init_failure_aborts_with_developer_error() {
        let mut h = harness_with(
            MockContainerFactory::with_failing_init(),
            Duration::from_secs(600),
        );
        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));

        assert!(matches!(
            recv(&mut h.pool_rx).await,
            PoolMsg::ContainerRemoved { .. }
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.store.count_for("a1"), 1);
        assert!(matches!(
            h.store.records()[0].response,
            ActivationResponse::DeveloperError { .. }
        ));
        // Container torn down
        assert_eq!(h.factory.containers()[0].destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_health_error_mid_run_reschedules() {
        let factory = MockContainerFactory::new();
        factory.push_run_outcome(MockOutcome::HealthError);
        let mut h = harness_with(factory, Duration::from_secs(600));

        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));

        match recv(&mut h.pool_rx).await {
            PoolMsg::Reschedule { msg, .. } => assert_eq!(msg.activation_id, "a1"),
            _ => panic!("expected Reschedule"),
        }
        assert!(matches!(
            recv(&mut h.pool_rx).await,
            PoolMsg::ContainerRemoved { .. }
        ));
        // No activation record for a rescheduled run
        assert_eq!(h.store.count_for("a1"), 0);
    }

    #[tokio::test]
    async fn test_probe_failure_resends_buffer_to_pool() {
        let factory = MockContainerFactory::new();
        factory.set_run_delay(Duration::from_millis(200));
        let mut h = harness_with(factory, Duration::from_secs(600));

        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));
        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a2", 1))));
        // Let a1 get in flight, then declare the container unhealthy
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.handle.send(ProxyMsg::Failure(ContainerFailure::Health(
            "ping failures".into(),
        )));

        let mut buffered_resent = false;
        let mut removed = false;
        for _ in 0..4 {
            match recv(&mut h.pool_rx).await {
                PoolMsg::Run(msg) => {
                    assert_eq!(msg.activation_id, "a2");
                    buffered_resent = true;
                }
                PoolMsg::ContainerRemoved { .. } => {
                    removed = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(buffered_resent);
        assert!(removed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_transitions_to_zygote_then_destroys() {
        let mut h = harness_with(MockContainerFactory::new(), Duration::from_secs(60));

        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));
        assert!(matches!(
            recv_eventually(&mut h.pool_rx).await,
            PoolMsg::NeedWork { .. }
        ));

        // keep-alive expiry → zygote
        match recv_eventually(&mut h.pool_rx).await {
            PoolMsg::ContainerIdle { data, .. } => assert!(data.is_warmed()),
            _ => panic!("expected ContainerIdle"),
        }

        // 2× unused timeout later → off-load signal + removal
        assert!(matches!(
            recv_eventually(&mut h.pool_rx).await,
            PoolMsg::OffLoadSignal { .. }
        ));
        assert!(matches!(
            recv_eventually(&mut h.pool_rx).await,
            PoolMsg::ContainerRemoved { .. }
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.factory.containers()[0].destroy_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zygote_run_emits_start_run_with_rate() {
        let mut h = harness_with(MockContainerFactory::new(), Duration::from_secs(60));
        h.handle
            .send(ProxyMsg::Run(Box::new(message("ptest04", "a1", 1))));
        assert!(matches!(
            recv_eventually(&mut h.pool_rx).await,
            PoolMsg::PreLoad { .. }
        ));
        assert!(matches!(
            recv_eventually(&mut h.pool_rx).await,
            PoolMsg::NeedWork { .. }
        ));
        assert!(matches!(
            recv_eventually(&mut h.pool_rx).await,
            PoolMsg::ContainerIdle { .. }
        ));

        // Run against the zygote
        h.handle
            .send(ProxyMsg::Run(Box::new(message("ptest04", "a2", 1))));
        match recv(&mut h.pool_rx).await {
            PoolMsg::StartRun {
                action_fqn, lambda, ..
            } => {
                assert_eq!(action_fqn, "guest/ptest04");
                assert!(lambda > 0.0);
            }
            _ => panic!("expected StartRun"),
        }
    }

    #[tokio::test]
    async fn test_load_and_offload_signals_are_forwarded() {
        let mut h = harness();
        h.handle
            .send(ProxyMsg::Run(Box::new(message("ptest04", "a1", 1))));
        assert!(matches!(recv(&mut h.pool_rx).await, PoolMsg::PreLoad { .. }));
        assert!(matches!(
            recv(&mut h.pool_rx).await,
            PoolMsg::NeedWork { .. }
        ));

        h.handle
            .send(ProxyMsg::LoadModel(Box::new(message("ptest05", "l1", 1))));
        h.handle
            .send(ProxyMsg::OffloadModel(Box::new(message("ptest05", "o1", 1))));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let container = h.factory.containers()[0].clone();
        assert_eq!(container.loaded(), vec!["guest/ptest05"]);
        assert_eq!(container.offloaded(), vec!["guest/ptest05"]);
    }

    #[tokio::test]
    async fn test_create_warmed_initializes_without_running() {
        let mut h = harness();
        h.handle
            .send(ProxyMsg::CreateWarmed(Box::new(message("fn", "a1", 1))));

        match recv(&mut h.pool_rx).await {
            PoolMsg::NeedWork { data, .. } => {
                assert!(data.is_warmed());
                assert!(data.serves("guest/fn"));
            }
            _ => panic!("expected NeedWork"),
        }
        let container = h.factory.containers()[0].clone();
        assert_eq!(container.init_count(), 1);
        assert_eq!(container.run_count(), 0);
    }

    #[tokio::test]
    async fn test_prewarm_start_reports_completion() {
        let mut h = harness();
        h.handle.send(ProxyMsg::Start {
            kind: "python:3".into(),
            image: "action-python-v3".into(),
            memory_mb: 256,
            ttl: Some(Duration::from_secs(60)),
        });

        match recv(&mut h.pool_rx).await {
            PoolMsg::PrewarmCompleted { data, .. } => match data {
                ContainerData::PreWarmed {
                    kind, memory_mb, ..
                } => {
                    assert_eq!(kind, "python:3");
                    assert_eq!(memory_mb, 256);
                }
                _ => panic!("expected PreWarmed data"),
            },
            _ => panic!("expected PrewarmCompleted"),
        }
    }

    #[tokio::test]
    async fn test_remove_destroys_and_reports() {
        let mut h = harness();
        h.handle
            .send(ProxyMsg::Run(Box::new(message("fn", "a1", 1))));
        assert!(matches!(
            recv(&mut h.pool_rx).await,
            PoolMsg::NeedWork { .. }
        ));

        h.handle.send(ProxyMsg::Remove);
        assert!(matches!(
            recv(&mut h.pool_rx).await,
            PoolMsg::ContainerRemoved { .. }
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.factory.containers()[0].destroy_count(), 1);
    }

    #[test]
    fn test_rate_per_minute() {
        assert_eq!(rate_per_minute(Duration::ZERO), 0.0);
        let r = rate_per_minute(Duration::from_secs(30));
        assert!((r - 2.0).abs() < 1e-9);
    }
}
