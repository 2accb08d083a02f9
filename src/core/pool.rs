//! Container pool — singleton actor owning all pool maps, the run buffer and
//! the pre-loading planner.
//!
//! Scheduling order for an activation: exact warm match, exact warming match,
//! pre-load hit, exact warming-cold match; then a matching prewarm, a cold
//! creation under the memory budget, eviction of the oldest idle containers,
//! and finally the run buffer.

use crate::activation::ActivationMessage;
use crate::container::health::HealthProbeConfig;
use crate::core::context::CoreContext;
use crate::core::data::ContainerData;
use crate::core::model_table::ModelData;
use crate::core::preload::PreloadTable;
use crate::core::proxy::{ContainerProxy, ProxyConfig, ProxyDeps, ProxyHandle, ProxyMsg};
use crate::core::ProxyId;
use crate::observability::metrics::StartKind;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Stagger window for opportunistic load bursts
const PRELOAD_STAGGER_MIN: Duration = Duration::from_millis(100);
const PRELOAD_STAGGER_MAX: Duration = Duration::from_millis(2100);

/// Source of new work when the pool has spare capacity
pub trait ActivationFeed: Send + Sync {
    /// Ask the feed for up to `count` more activations
    fn request(&self, count: usize);
}

/// Feed that never produces anything (embedders push work directly)
pub struct NoopFeed;

impl ActivationFeed for NoopFeed {
    fn request(&self, _count: usize) {}
}

/// Feed that records every request (test support)
#[derive(Default)]
pub struct RecordingFeed {
    requests: std::sync::Mutex<Vec<usize>>,
}

impl RecordingFeed {
    /// Create a new recording feed
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded request sizes
    pub fn requests(&self) -> Vec<usize> {
        self.requests.lock().unwrap().clone()
    }
}

impl ActivationFeed for RecordingFeed {
    fn request(&self, count: usize) {
        self.requests.lock().unwrap().push(count);
    }
}

/// Messages handled by the pool
pub enum PoolMsg {
    /// Execute one activation
    Run(Box<ActivationMessage>),
    /// A proxy finished a run and is available again
    NeedWork {
        /// Sender
        proxy: ProxyId,
        /// Authoritative container data
        data: ContainerData,
    },
    /// A proxy's keep-alive expired; it is now a zygote
    ContainerIdle {
        /// Sender
        proxy: ProxyId,
        /// Authoritative container data
        data: ContainerData,
    },
    /// Execution is starting on a zygote container
    StartRun {
        /// Sender
        proxy: ProxyId,
        /// Container data at the time of the run
        data: ContainerData,
        /// Action being executed
        action_fqn: String,
        /// Arrival rate implied by the idle gap
        lambda: f64,
    },
    /// A finished inference run asks for its model to be re-homed later
    PreLoad {
        /// Owning action
        action_fqn: String,
    },
    /// A zygote container is being destroyed; its models need new homes
    OffLoadSignal {
        /// Sender
        proxy: ProxyId,
        /// Container data at destruction time
        data: ContainerData,
    },
    /// A proxy's container is gone
    ContainerRemoved {
        /// Sender
        proxy: ProxyId,
        /// Whether a replacement prewarm should be started
        replace_prewarm: bool,
    },
    /// A run could not be executed on its container and must go elsewhere
    Reschedule {
        /// Sender
        proxy: ProxyId,
        /// The activation to re-place
        msg: Box<ActivationMessage>,
    },
    /// A stem cell finished starting
    PrewarmCompleted {
        /// Sender
        proxy: ProxyId,
        /// PreWarmed container data
        data: ContainerData,
    },
    /// Recompute desired prewarm counts
    AdjustPrewarms {
        /// True on periodic ticks, false at init
        scheduled: bool,
    },
    /// Emit pool gauges
    EmitMetrics,
    /// Deadline-driven: attempt one model placement now
    TryPreload {
        /// Owning action of the model to place
        action_fqn: String,
    },
    /// Deadline-driven: drop one pre-loaded model whose window expired
    TryOffload {
        /// Host container
        proxy: ProxyId,
        /// Model to drop
        model_name: String,
    },
    /// Stop the pool loop
    Shutdown,
}

/// Pool construction options
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Whether proxies spawn TCP health probes (off under mock factories)
    pub health_probes_enabled: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            health_probes_enabled: true,
        }
    }
}

/// Send handle to the pool
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<PoolMsg>,
}

impl PoolHandle {
    /// Submit one activation
    pub fn submit(&self, msg: ActivationMessage) -> bool {
        self.tx.send(PoolMsg::Run(Box::new(msg))).is_ok()
    }

    /// Deliver a raw pool message
    pub fn send(&self, msg: PoolMsg) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// The pool actor
pub struct ContainerPool {
    ctx: Arc<CoreContext>,
    deps: Arc<ProxyDeps>,
    feed: Arc<dyn ActivationFeed>,
    options: PoolOptions,
    tx: mpsc::UnboundedSender<PoolMsg>,

    proxies: HashMap<ProxyId, ProxyHandle>,
    free_pool: HashMap<ProxyId, ContainerData>,
    busy_pool: HashMap<ProxyId, ContainerData>,
    prewarmed_pool: HashMap<ProxyId, ContainerData>,
    prewarm_starting: HashMap<ProxyId, (String, u64)>,
    /// Zygote markers, subset of `free_pool`
    zygote_pool: HashSet<ProxyId>,
    /// Sharable idle containers, subset of `free_pool`
    shared_pool: HashSet<ProxyId>,
    preload_table: PreloadTable,

    run_buffer: VecDeque<ActivationMessage>,
    /// Activation id of the buffer head currently re-injected, if any
    resent: Option<String>,
    /// Cold starts per (kind, memory) since the last scheduled prewarm tick
    cold_start_counts: HashMap<(String, u64), u64>,
    /// Last activation message seen per action; model signals are built from it
    action_cache: HashMap<String, ActivationMessage>,

    next_proxy_id: u64,
    last_buffer_warning: Option<Instant>,
}

impl ContainerPool {
    /// Build a pool without starting its loop (the loop is `run_loop`)
    fn new(
        ctx: Arc<CoreContext>,
        deps: Arc<ProxyDeps>,
        feed: Arc<dyn ActivationFeed>,
        options: PoolOptions,
    ) -> (Self, mpsc::UnboundedReceiver<PoolMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Self {
            ctx,
            deps,
            feed,
            options,
            tx,
            proxies: HashMap::new(),
            free_pool: HashMap::new(),
            busy_pool: HashMap::new(),
            prewarmed_pool: HashMap::new(),
            prewarm_starting: HashMap::new(),
            zygote_pool: HashSet::new(),
            shared_pool: HashSet::new(),
            preload_table: PreloadTable::new(),
            run_buffer: VecDeque::new(),
            resent: None,
            cold_start_counts: HashMap::new(),
            action_cache: HashMap::new(),
            next_proxy_id: 0,
            last_buffer_warning: None,
        };
        (pool, rx)
    }

    /// Spawn the pool actor and its periodic jobs, returning the handle
    pub fn spawn(
        ctx: Arc<CoreContext>,
        deps: Arc<ProxyDeps>,
        feed: Arc<dyn ActivationFeed>,
        options: PoolOptions,
    ) -> PoolHandle {
        let (pool, rx) = Self::new(ctx.clone(), deps, feed, options);
        let handle = PoolHandle {
            tx: pool.tx.clone(),
        };

        // Announce ourselves to the fleet
        {
            let fleet = ctx.fleet.clone();
            tokio::spawn(async move { fleet.publish_identity().await });
        }

        // One unconditional sizing pass at construction
        handle.send(PoolMsg::AdjustPrewarms { scheduled: false });

        // The periodic check only runs when some shape is reactive
        if ctx.config.prewarm.iter().any(|p| p.reactive.is_some()) {
            let tx = pool.tx.clone();
            let base = ctx.config.timers.prewarm_expiration_check_secs;
            let variance = ctx.config.timers.prewarm_expiration_check_variance_secs;
            tokio::spawn(async move {
                loop {
                    let jitter: i64 =
                        rand::thread_rng().gen_range(-(variance as i64)..=(variance as i64));
                    let secs = (base as i64 + jitter).max(1) as u64;
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    if tx.send(PoolMsg::AdjustPrewarms { scheduled: true }).is_err() {
                        break;
                    }
                }
            });
        }

        // Periodic gauge emission
        {
            let tx = pool.tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    if tx.send(PoolMsg::EmitMetrics).is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(pool.run_loop(rx));
        handle
    }

    async fn run_loop(mut self, mut rx: mpsc::UnboundedReceiver<PoolMsg>) {
        while let Some(msg) = rx.recv().await {
            if matches!(msg, PoolMsg::Shutdown) {
                break;
            }
            self.handle(msg).await;
        }
        for (_, proxy) in self.proxies.drain() {
            proxy.send(ProxyMsg::Remove);
        }
        tracing::info!("Container pool stopped");
    }

    async fn handle(&mut self, msg: PoolMsg) {
        match msg {
            PoolMsg::Run(msg) => self.on_run(*msg),
            PoolMsg::NeedWork { proxy, data } => self.on_need_work(proxy, data),
            PoolMsg::ContainerIdle { proxy, data } => self.on_container_idle(proxy, data),
            PoolMsg::StartRun {
                proxy,
                data: _,
                action_fqn,
                lambda,
            } => self.on_start_run(proxy, action_fqn, lambda),
            PoolMsg::PreLoad { action_fqn } => self.on_pre_load(action_fqn),
            PoolMsg::OffLoadSignal { proxy, data: _ } => self.on_off_load_signal(proxy),
            PoolMsg::ContainerRemoved {
                proxy,
                replace_prewarm,
            } => self.on_container_removed(proxy, replace_prewarm),
            PoolMsg::Reschedule { proxy, msg } => self.on_reschedule(proxy, *msg),
            PoolMsg::PrewarmCompleted { proxy, data } => self.on_prewarm_completed(proxy, data),
            PoolMsg::AdjustPrewarms { scheduled } => {
                let mode = if scheduled {
                    PrewarmAdjust::Scheduled
                } else {
                    PrewarmAdjust::Init
                };
                self.adjust_prewarms(mode);
            }
            PoolMsg::EmitMetrics => self.emit_metrics(),
            PoolMsg::TryPreload { action_fqn } => self.try_preload(&action_fqn),
            PoolMsg::TryOffload { proxy, model_name } => self.try_offload(proxy, &model_name),
            PoolMsg::Shutdown => {}
        }
    }

    // ── Run placement ─────────────────────────────────────────────────────────

    fn on_run(&mut self, msg: ActivationMessage) {
        let fqn = msg.action.fqn();
        self.ctx.windows.record(&fqn, msg.windows);
        self.action_cache.insert(fqn, msg.clone());

        let is_resent_head = self.resent.as_deref() == Some(msg.activation_id.as_str());
        if is_resent_head {
            self.resent = None;
        }

        // Keep strict FIFO: while older work waits, only the re-injected head
        // may attempt placement
        if !is_resent_head && !self.run_buffer.is_empty() {
            self.run_buffer.push_back(msg);
            self.process_buffer_or_feed();
            return;
        }

        if self.try_place(&msg) {
            if is_resent_head {
                self.run_buffer.pop_front();
            }
            self.publish_busy_pool_size();
        } else if is_resent_head {
            // Head stays buffered; it will be resent on the next capacity event
        } else {
            self.buffer_with_warning(msg);
        }
    }

    /// Scheduling decision: first match wins
    fn schedule(&self, msg: &ActivationMessage) -> Option<(ProxyId, StartKind)> {
        let fqn = msg.action.fqn();

        // 1. Warm container for the exact action with capacity
        if let Some(id) = self.free_pool.iter().find_map(|(id, data)| {
            (data.is_warmed() && data.serves(&fqn) && data.has_capacity()).then_some(*id)
        }) {
            return Some((id, StartKind::Warm));
        }

        // 2. Warming container for the exact action
        if let Some(id) = self.free_pool.iter().find_map(|(id, data)| {
            (matches!(data, ContainerData::Warming { .. })
                && data.serves(&fqn)
                && data.has_capacity())
            .then_some(*id)
        }) {
            return Some((id, StartKind::Warming));
        }

        // 3. Pre-load hit: a sharable container already holds the model
        if let Some(model) = self.ctx.models.find_by_action_name(&fqn) {
            let mut hosts: Vec<ProxyId> = self
                .preload_table
                .hosts_of_model(&model.model_name)
                .into_iter()
                .filter(|id| self.shared_pool.contains(id))
                .filter(|id| {
                    self.free_pool
                        .get(id)
                        .map(|d| d.has_capacity())
                        .unwrap_or(false)
                })
                .collect();
            hosts.sort_by_key(|id| self.preload_table.total_size(*id));
            if let Some(id) = hosts.first() {
                return Some((*id, StartKind::Preloaded));
            }
        }

        // 4. Cold-warming container for the exact action
        if let Some(id) = self.free_pool.iter().find_map(|(id, data)| {
            (matches!(data, ContainerData::WarmingCold { .. })
                && data.serves(&fqn)
                && data.has_capacity())
            .then_some(*id)
        }) {
            return Some((id, StartKind::Warming));
        }

        None
    }

    fn try_place(&mut self, msg: &ActivationMessage) -> bool {
        if let Some((id, kind)) = self.schedule(msg) {
            self.ctx.metrics.record_start(kind);
            self.admit(id, msg.clone());
            return true;
        }

        if let Some(id) = self.take_prewarm(msg) {
            self.ctx.metrics.record_start(StartKind::Prewarmed);
            self.forward_to_prewarm(id, msg.clone());
            return true;
        }

        let needed = msg.action.limits.memory_mb;
        if self.has_space(needed) {
            self.ctx.metrics.record_start(StartKind::Cold);
            self.create_and_run(msg.clone());
            return true;
        }

        // Evict the oldest idle warm containers until enough memory is freed
        if self.evict(needed) {
            if let Some(id) = self.take_prewarm(msg) {
                self.ctx.metrics.record_start(StartKind::RecreatedPrewarm);
                self.forward_to_prewarm(id, msg.clone());
            } else {
                self.ctx.metrics.record_start(StartKind::Recreated);
                self.create_and_run(msg.clone());
            }
            return true;
        }

        false
    }

    fn admit(&mut self, id: ProxyId, msg: ActivationMessage) {
        let Some(data) = self
            .free_pool
            .remove(&id)
            .or_else(|| self.busy_pool.remove(&id))
        else {
            tracing::error!(proxy = %id, "Admit on an unknown container");
            return;
        };
        // An admitted container is no longer sharable
        self.shared_pool.remove(&id);
        self.zygote_pool.remove(&id);

        let data = data.incremented();
        if data.has_capacity() {
            self.free_pool.insert(id, data);
        } else {
            self.busy_pool.insert(id, data);
        }

        if let Some(proxy) = self.proxies.get(&id) {
            proxy.send(ProxyMsg::Run(Box::new(msg)));
        }
    }

    fn create_and_run(&mut self, msg: ActivationMessage) {
        let id = self.spawn_proxy();
        let data = ContainerData::WarmingCold {
            action: msg.action.clone(),
            last_used: Instant::now(),
            active: 1,
        };
        if data.has_capacity() {
            self.free_pool.insert(id, data);
        } else {
            self.busy_pool.insert(id, data);
        }
        *self
            .cold_start_counts
            .entry((msg.action.exec.kind.clone(), msg.action.limits.memory_mb))
            .or_insert(0) += 1;
        if let Some(proxy) = self.proxies.get(&id) {
            proxy.send(ProxyMsg::Run(Box::new(msg)));
        }
    }

    /// Take the prewarm with the earliest expiry matching (kind, memory)
    fn take_prewarm(&mut self, msg: &ActivationMessage) -> Option<ProxyId> {
        let kind = &msg.action.exec.kind;
        let memory = msg.action.limits.memory_mb;
        let id = self
            .prewarmed_pool
            .iter()
            .filter(|(_, data)| match data {
                ContainerData::PreWarmed {
                    kind: k,
                    memory_mb,
                    ..
                } => k == kind && *memory_mb == memory,
                _ => false,
            })
            .min_by_key(|(_, data)| match data {
                ContainerData::PreWarmed { expires_at, .. } => {
                    expires_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365))
                }
                _ => Instant::now(),
            })
            .map(|(id, _)| *id)?;

        let prewarm_data = self.prewarmed_pool.remove(&id)?;
        let container_id = prewarm_data.container_id().unwrap_or_default().to_string();
        let data = ContainerData::Warming {
            container_id,
            action: msg.action.clone(),
            last_used: Instant::now(),
            active: 1,
        };
        if data.has_capacity() {
            self.free_pool.insert(id, data);
        } else {
            self.busy_pool.insert(id, data);
        }

        // Backfill a stem cell of the same shape
        let shape = self
            .ctx
            .config
            .prewarm
            .iter()
            .find(|p| p.kind == *kind && p.memory_mb == memory)
            .cloned();
        if let Some(shape) = shape {
            self.spawn_prewarm(&shape);
        }
        Some(id)
    }

    fn forward_to_prewarm(&mut self, id: ProxyId, msg: ActivationMessage) {
        if let Some(proxy) = self.proxies.get(&id) {
            proxy.send(ProxyMsg::Run(Box::new(msg)));
        }
    }

    /// Remove the oldest unused warm containers until `needed` MB are freed.
    /// Returns false (and removes nothing) when not enough can be freed.
    fn evict(&mut self, needed: u64) -> bool {
        let mut candidates: Vec<(ProxyId, Instant, u64)> = self
            .free_pool
            .iter()
            .filter(|(_, data)| data.is_warmed() && data.active() == 0)
            .filter_map(|(id, data)| data.last_used().map(|t| (*id, t, data.memory_mb())))
            .collect();
        candidates.sort_by_key(|(_, last_used, _)| *last_used);

        let mut chosen = Vec::new();
        let mut freed = 0u64;
        for (id, _, memory) in candidates {
            if freed >= needed {
                break;
            }
            chosen.push(id);
            freed += memory;
        }
        if freed < needed {
            return false;
        }

        for id in chosen {
            tracing::info!(proxy = %id, "Evicting idle container to free memory");
            self.free_pool.remove(&id);
            self.shared_pool.remove(&id);
            self.zygote_pool.remove(&id);
            if let Some(proxy) = self.proxies.get(&id) {
                proxy.send(ProxyMsg::Remove);
            }
        }
        true
    }

    fn buffer_with_warning(&mut self, msg: ActivationMessage) {
        let warn_interval =
            Duration::from_secs(self.ctx.config.timers.buffer_warning_interval_secs);
        let should_warn = self
            .last_buffer_warning
            .map(|t| t.elapsed() >= warn_interval)
            .unwrap_or(true);
        if should_warn {
            self.last_buffer_warning = Some(Instant::now());
            tracing::warn!(
                buffered = self.run_buffer.len() + 1,
                action = %msg.action.fqn(),
                "Memory exhausted and nothing evictable; buffering activation"
            );
        }
        self.run_buffer.push_back(msg);
    }

    /// Re-inject the buffer head once, or pull fresh work from the feed
    fn process_buffer_or_feed(&mut self) {
        if let Some(head) = self.run_buffer.front() {
            if self.resent.is_none() {
                self.resent = Some(head.activation_id.clone());
                let _ = self.tx.send(PoolMsg::Run(Box::new(head.clone())));
            }
        } else {
            self.feed.request(1);
        }
    }

    // ── Proxy feedback ────────────────────────────────────────────────────────

    fn on_need_work(&mut self, proxy: ProxyId, data: ContainerData) {
        if !self.proxies.contains_key(&proxy) {
            return;
        }
        // The container executed; it is no longer sharable
        self.shared_pool.remove(&proxy);
        self.zygote_pool.remove(&proxy);
        self.preload_table.remove_container(proxy);
        self.publish_preloaded_actions();

        self.busy_pool.remove(&proxy);
        self.free_pool.remove(&proxy);
        if data.has_capacity() {
            self.free_pool.insert(proxy, data.clone());
        } else {
            self.busy_pool.insert(proxy, data.clone());
        }
        self.publish_busy_pool_size();

        // Keep this function's own model hot on the container it just used
        if let Some(action) = data.action() {
            let fqn = action.fqn();
            if self.ctx.models.is_inference_action(&fqn) {
                if let Some(signal) = self.signal_message(&fqn) {
                    if let Some(handle) = self.proxies.get(&proxy) {
                        handle.send(ProxyMsg::LoadModel(Box::new(signal)));
                    }
                }
            }
        }

        self.process_buffer_or_feed();
    }

    fn on_container_idle(&mut self, proxy: ProxyId, data: ContainerData) {
        if !self.proxies.contains_key(&proxy) {
            return;
        }
        // A zygote is idle by definition
        self.busy_pool.remove(&proxy);
        self.free_pool.insert(proxy, data);
        self.zygote_pool.insert(proxy);
        self.shared_pool.insert(proxy);
        self.preload_table.init_container(proxy);
        self.publish_preloaded_actions();

        // Offer every unassigned model a home, staggered to avoid a burst
        for model in self.ctx.models.all() {
            if self.preload_table.model_assigned(&model.model_name) {
                continue;
            }
            let tx = self.tx.clone();
            let action_fqn = model.action_name.clone();
            let delay = rand::thread_rng().gen_range(PRELOAD_STAGGER_MIN..=PRELOAD_STAGGER_MAX);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(PoolMsg::TryPreload { action_fqn });
            });
        }

        self.ctx.models.update_all_derived(1.0);
    }

    fn on_start_run(&mut self, proxy: ProxyId, action_fqn: String, lambda: f64) {
        self.ctx.models.update_lambda(&action_fqn, lambda);
        self.ctx.models.update_all_derived(1.0);

        self.shared_pool.remove(&proxy);
        self.zygote_pool.remove(&proxy);
        let displaced = self.preload_table.remove_container(proxy);
        self.publish_preloaded_actions();

        // Models that were resident for other actions move elsewhere
        for model in displaced {
            if model.action_name != action_fqn {
                self.place_model(model);
            }
        }
    }

    fn on_pre_load(&mut self, action_fqn: String) {
        let delay_minutes = self.ctx.windows.pre_load_window(&action_fqn);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_minutes * 60)).await;
            let _ = tx.send(PoolMsg::TryPreload { action_fqn });
        });
    }

    fn on_off_load_signal(&mut self, proxy: ProxyId) {
        self.shared_pool.remove(&proxy);
        self.zygote_pool.remove(&proxy);
        let displaced = self.preload_table.remove_container(proxy);
        self.publish_preloaded_actions();

        for model in displaced {
            let new_host = self.place_model(model.clone());

            // The model's usefulness window keeps running on its new host
            if let Some(host) = new_host {
                if let Some(delay_minutes) = self.ctx.windows.off_load_delay(&model.action_name) {
                    let tx = self.tx.clone();
                    let model_name = model.model_name.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(delay_minutes * 60)).await;
                        let _ = tx.send(PoolMsg::TryOffload {
                            proxy: host,
                            model_name,
                        });
                    });
                }
            }
        }
    }

    fn on_container_removed(&mut self, proxy: ProxyId, replace_prewarm: bool) {
        self.proxies.remove(&proxy);
        self.free_pool.remove(&proxy);
        self.busy_pool.remove(&proxy);
        self.prewarmed_pool.remove(&proxy);
        self.prewarm_starting.remove(&proxy);
        self.shared_pool.remove(&proxy);
        self.zygote_pool.remove(&proxy);
        self.preload_table.remove_container(proxy);
        self.publish_preloaded_actions();
        self.publish_busy_pool_size();

        if replace_prewarm {
            self.adjust_prewarms(PrewarmAdjust::Backfill);
        }
        self.process_buffer_or_feed();
    }

    fn on_reschedule(&mut self, proxy: ProxyId, msg: ActivationMessage) {
        self.free_pool.remove(&proxy);
        self.busy_pool.remove(&proxy);
        self.publish_busy_pool_size();
        self.on_run(msg);
    }

    fn on_prewarm_completed(&mut self, proxy: ProxyId, data: ContainerData) {
        self.prewarm_starting.remove(&proxy);
        self.prewarmed_pool.insert(proxy, data);
    }

    // ── Pre-loading planner ───────────────────────────────────────────────────

    /// Attempt one placement now; a no-op when the model found a home in the
    /// meantime or its target container died.
    fn try_preload(&mut self, action_fqn: &str) {
        let Some(model) = self.ctx.models.find_by_action_name(action_fqn) else {
            return;
        };
        if self.preload_table.model_assigned(&model.model_name) {
            return;
        }
        self.place_model(model);
    }

    /// Bin-pack one model onto a sharable container, delivering the load and
    /// any eviction off-loads. Returns the chosen host.
    fn place_model(&mut self, model: ModelData) -> Option<ProxyId> {
        // A load signal can only be built from a message this invoker has
        // seen; without one the placement would be bookkeeping fiction
        if !self.action_cache.contains_key(&model.action_name) {
            tracing::debug!(action = %model.action_name, "No cached message; skipping pre-load");
            return None;
        }
        let outcome = self.preload_table.bin_packing(&self.shared_pool, &model);

        for (host, evicted) in &outcome.evicted {
            tracing::info!(
                model = %evicted.model_name,
                host = %host,
                replacement = %model.model_name,
                "Evicting pre-loaded model with lower expected savings"
            );
            if let Some(signal) = self.signal_message(&evicted.action_name) {
                if let Some(handle) = self.proxies.get(host) {
                    handle.send(ProxyMsg::OffloadModel(Box::new(signal)));
                }
            }
        }

        let target = outcome.target?;
        if !self.preload_table.append(target, model.clone()) {
            return None;
        }
        tracing::info!(
            model = %model.model_name,
            action = %model.action_name,
            host = %target,
            "Pre-loading model onto idle container"
        );
        if let Some(signal) = self.signal_message(&model.action_name) {
            if let Some(handle) = self.proxies.get(&target) {
                handle.send(ProxyMsg::LoadModel(Box::new(signal)));
            }
        }
        self.publish_preloaded_actions();
        Some(target)
    }

    fn try_offload(&mut self, proxy: ProxyId, model_name: &str) {
        let Some(model) = self.preload_table.remove_model(proxy, model_name) else {
            return;
        };
        tracing::info!(model = %model_name, host = %proxy, "Off-loading expired pre-loaded model");
        if let Some(signal) = self.signal_message(&model.action_name) {
            if let Some(handle) = self.proxies.get(&proxy) {
                handle.send(ProxyMsg::OffloadModel(Box::new(signal)));
            }
        }
        self.publish_preloaded_actions();
    }

    /// Build a model-signal activation message from the last message seen for
    /// the action; absent when the action never ran on this invoker.
    fn signal_message(&self, action_fqn: &str) -> Option<ActivationMessage> {
        let cached = self.action_cache.get(action_fqn)?;
        let mut msg = cached.clone();
        msg.activation_id = uuid::Uuid::new_v4().to_string();
        msg.transaction_id = format!("model-signal-{}", &msg.activation_id[..8]);
        msg.blocking = false;
        Some(msg)
    }

    // ── Prewarm management ────────────────────────────────────────────────────

    fn adjust_prewarms(&mut self, mode: PrewarmAdjust) {
        // Expire overdue stem cells first
        let now = Instant::now();
        let expired: Vec<ProxyId> = self
            .prewarmed_pool
            .iter()
            .filter(|(_, data)| match data {
                ContainerData::PreWarmed { expires_at, .. } => {
                    expires_at.map(|t| t <= now).unwrap_or(false)
                }
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            tracing::debug!(proxy = %id, "Prewarm expired");
            self.prewarmed_pool.remove(id);
            if let Some(proxy) = self.proxies.get(id) {
                proxy.send(ProxyMsg::Remove);
            }
        }
        let backfill_after_expiry = !expired.is_empty();

        let shapes = self.ctx.config.prewarm.clone();
        for shape in &shapes {
            let current = self.count_prewarms(&shape.kind, shape.memory_mb);
            let desired = match mode {
                PrewarmAdjust::Init => shape.initial_count,
                PrewarmAdjust::Scheduled => {
                    let cold = self
                        .cold_start_counts
                        .get(&(shape.kind.clone(), shape.memory_mb))
                        .copied()
                        .unwrap_or(0);
                    if shape.reactive.is_some() {
                        shape.desired_count(cold)
                    } else if backfill_after_expiry {
                        shape.backfill_count()
                    } else {
                        current
                    }
                }
                PrewarmAdjust::Backfill => shape.backfill_count(),
            };
            for _ in current..desired {
                self.spawn_prewarm(shape);
            }
        }

        if matches!(mode, PrewarmAdjust::Scheduled) {
            self.cold_start_counts.clear();
        }
    }

    fn count_prewarms(&self, kind: &str, memory_mb: u64) -> u32 {
        let running = self
            .prewarmed_pool
            .values()
            .filter(|data| match data {
                ContainerData::PreWarmed {
                    kind: k,
                    memory_mb: m,
                    ..
                } => k == kind && *m == memory_mb,
                _ => false,
            })
            .count();
        let starting = self
            .prewarm_starting
            .values()
            .filter(|(k, m)| k == kind && *m == memory_mb)
            .count();
        (running + starting) as u32
    }

    fn spawn_prewarm(&mut self, shape: &crate::config::PrewarmingConfig) {
        if !self.has_space(shape.memory_mb) {
            tracing::warn!(kind = %shape.kind, "No memory left for a prewarm");
            return;
        }
        let id = self.spawn_proxy();
        self.prewarm_starting
            .insert(id, (shape.kind.clone(), shape.memory_mb));
        if let Some(proxy) = self.proxies.get(&id) {
            proxy.send(ProxyMsg::Start {
                kind: shape.kind.clone(),
                image: shape.image(),
                memory_mb: shape.memory_mb,
                ttl: shape.ttl_minutes.map(|m| Duration::from_secs(m * 60)),
            });
        }
    }

    // ── Bookkeeping ───────────────────────────────────────────────────────────

    fn spawn_proxy(&mut self) -> ProxyId {
        self.next_proxy_id += 1;
        let id = ProxyId(self.next_proxy_id);
        let config = ProxyConfig {
            unused_timeout: Duration::from_secs(
                self.ctx.windows.default_keep_alive_minutes() * 60,
            ),
            health: HealthProbeConfig {
                check_period: Duration::from_millis(self.ctx.config.health.check_period_ms),
                connect_timeout: Duration::from_millis(self.ctx.config.health.connect_timeout_ms),
                max_fails: self.ctx.config.health.max_fails,
            },
            health_probes_enabled: self.options.health_probes_enabled,
        };
        let handle = ContainerProxy::spawn(
            id,
            self.ctx.clone(),
            self.deps.clone(),
            self.tx.clone(),
            config,
        );
        self.proxies.insert(id, handle);
        id
    }

    /// Memory used by all pools plus starting prewarms (MB)
    fn memory_used(&self) -> u64 {
        let pools: u64 = self
            .free_pool
            .values()
            .chain(self.busy_pool.values())
            .chain(self.prewarmed_pool.values())
            .map(|d| d.memory_mb())
            .sum();
        let starting: u64 = self.prewarm_starting.values().map(|(_, m)| m).sum();
        pools + starting
    }

    fn has_space(&self, needed: u64) -> bool {
        self.memory_used() + needed <= self.ctx.config.user_memory_mb
    }

    fn publish_busy_pool_size(&self) {
        let fleet = self.ctx.fleet.clone();
        let size = self.busy_pool.len();
        tokio::spawn(async move { fleet.publish_busy_pool_size(size).await });
    }

    fn publish_preloaded_actions(&self) {
        let fleet = self.ctx.fleet.clone();
        let names = self.preload_table.distinct_action_names();
        tokio::spawn(async move { fleet.publish_preloaded_actions(&names).await });
    }

    fn emit_metrics(&self) {
        let buffered = self.run_buffer.len();
        let active: usize = self
            .busy_pool
            .values()
            .chain(self.free_pool.values())
            .map(|d| d.active() as usize)
            .sum();
        let active_mb: u64 = self.busy_pool.values().map(|d| d.memory_mb()).sum();
        let idle_mb: u64 = self.free_pool.values().map(|d| d.memory_mb()).sum();
        let prewarm_mb: u64 = self
            .prewarmed_pool
            .values()
            .map(|d| d.memory_mb())
            .sum::<u64>()
            + self.prewarm_starting.values().map(|(_, m)| m).sum::<u64>();

        self.ctx
            .metrics
            .set_pool_gauges(buffered, active, active_mb, idle_mb, prewarm_mb);
        tracing::info!(
            buffered,
            active,
            active_mb,
            idle_mb,
            prewarm_mb,
            "Pool gauges"
        );
    }
}

/// Why prewarm counts are being recomputed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrewarmAdjust {
    /// Unconditional pass at pool construction
    Init,
    /// Periodic tick
    Scheduled,
    /// Replacement after a removal
    Backfill,
}
