use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::api::{EngineConfig, EngineEvent, EngineHandle, StatusSnapshot};
use crate::backend::Backends;
use crate::claims::ClaimRegistry;
use crate::model::{MasterTask, MasterTaskStatus};
use crate::poller::SnapshotCache;
use crate::pool::InstancePool;
use crate::rate_limit::RateLimiters;
use crate::recovery::RecoveryStats;
use crate::samples::SampleSource;
use crate::store::TaskStore;
use samplefarm_core::ExecutionConfig;

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    pub(crate) nudge: Notify,
    pub(crate) snapshots: Arc<SnapshotCache>,
    stop_tx: watch::Sender<bool>,
}

impl EngineInner {
    fn new() -> (Self, watch::Sender<StatusSnapshot>) {
        let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);
        let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot::default());
        let (stop_tx, _) = watch::channel(false);
        let inner = Self {
            event_tx,
            snapshot_rx,
            nudge: Notify::new(),
            snapshots: Arc::new(SnapshotCache::default()),
            stop_tx,
        };
        (inner, snapshot_tx)
    }

    pub(crate) fn request_stop(&self) {
        if !self.stop_tx.send_replace(true) {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
        }
    }

    pub(crate) fn should_stop(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves once a stop has been requested.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// State shared by every engine loop.
pub(crate) struct Shared {
    pub(crate) cfg: EngineConfig,
    pub(crate) store: TaskStore,
    pub(crate) backends: Backends,
    pub(crate) samples: Arc<dyn SampleSource>,
    pub(crate) pool: InstancePool,
    pub(crate) limiters: RateLimiters,
    pub(crate) snapshots: Arc<SnapshotCache>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) claims: ClaimRegistry,
    pub(crate) last_recovery: Mutex<Option<RecoveryStats>>,
    pub(crate) inner: Arc<EngineInner>,
}

impl Shared {
    pub(crate) fn new(
        cfg: EngineConfig,
        store: TaskStore,
        backends: Backends,
        samples: Arc<dyn SampleSource>,
        inner: Arc<EngineInner>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(cfg.max_concurrency.max(1))),
            cfg,
            store,
            backends,
            samples,
            pool: InstancePool::default(),
            limiters: RateLimiters::default(),
            claims: ClaimRegistry::default(),
            snapshots: inner.snapshots.clone(),
            last_recovery: Mutex::new(None),
            inner,
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    /// Execution parameters of a batch, falling back to the engine default.
    pub(crate) fn execution(&self, master: &MasterTask) -> ExecutionConfig {
        master
            .execution
            .clone()
            .unwrap_or_else(|| self.cfg.default_execution.clone())
    }

    /// Emit [`EngineEvent::MasterFinalized`] if the batch is now terminal.
    pub(crate) async fn note_finalized(&self, master_id: Uuid) {
        match self.store.call(move |s| s.master_task(master_id)).await {
            Ok(master) if master.status.is_terminal() => self.finalized(master_id, master.status),
            Ok(_) => {}
            Err(err) => tracing::warn!(master_task_id = %master_id, error = %err, "reading batch state failed"),
        }
    }

    pub(crate) fn finalized(&self, master_id: Uuid, status: MasterTaskStatus) {
        tracing::info!(master_task_id = %master_id, %status, "batch finalized");
        self.limiters.remove(master_id);
        self.emit(EngineEvent::MasterFinalized {
            master_task_id: master_id,
            status,
        });
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        cfg: EngineConfig,
        store: TaskStore,
        backends: Backends,
        samples: Arc<dyn SampleSource>,
    ) -> Arc<Self> {
        let (inner, _snapshot_tx) = EngineInner::new();
        Arc::new(Self::new(cfg, store, backends, samples, Arc::new(inner)))
    }
}

struct EngineRuntime {
    shared: Arc<Shared>,
    dispatchers: JoinSet<Uuid>,
    dispatching: HashSet<Uuid>,
    background: JoinSet<&'static str>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
}

impl EngineRuntime {
    fn build_snapshot(&self) -> StatusSnapshot {
        let mut dispatching: Vec<Uuid> = self.dispatching.iter().copied().collect();
        dispatching.sort();
        StatusSnapshot {
            stop_requested: self.shared.inner.should_stop(),
            dispatching,
            tracked_remote: self.shared.snapshots.len(),
            submitting: self.shared.claims.len(),
            last_recovery: self
                .shared
                .last_recovery
                .lock()
                .ok()
                .and_then(|guard| *guard),
        }
    }

    fn push_snapshot(&self) {
        let snap = self.build_snapshot();
        let _ = self.snapshot_tx.send(snap);
    }

    fn emit(&self, event: EngineEvent) {
        self.shared.emit(event);
    }

    fn spawn_background(&mut self) {
        let shared = self.shared.clone();
        self.background.spawn(async move {
            crate::poller::run_poll_loop(shared).await;
            "poller"
        });
        let shared = self.shared.clone();
        self.background.spawn(async move {
            crate::health::run_health_loop(shared).await;
            "health checker"
        });
        let shared = self.shared.clone();
        self.background.spawn(async move {
            crate::recovery::run_recovery_loop(shared).await;
            "recovery scanner"
        });
        let shared = self.shared.clone();
        self.background.spawn(async move {
            crate::recovery::run_sweep_loop(shared).await;
            "failed-task sweep"
        });
    }

    /// Make sure every running batch has a dispatch loop.
    async fn reconcile_dispatchers(&mut self) {
        if self.shared.inner.should_stop() {
            return;
        }
        let running = match self
            .shared
            .store
            .call(|s| s.master_ids_with_status(&[MasterTaskStatus::Running]))
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                self.emit(EngineEvent::Warning {
                    message: format!("listing running batches failed: {err}"),
                });
                return;
            }
        };

        for master_id in running {
            if !self.dispatching.insert(master_id) {
                continue;
            }
            tracing::info!(master_task_id = %master_id, "starting dispatch loop");
            self.emit(EngineEvent::DispatchStarted {
                master_task_id: master_id,
            });
            let shared = self.shared.clone();
            self.dispatchers.spawn(async move {
                crate::dispatcher::run_dispatch_loop(shared, master_id).await;
                master_id
            });
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(EngineEvent::Started);
        self.push_snapshot();
        self.spawn_background();

        let mut tick = tokio::time::interval(self.shared.cfg.dispatch_idle);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let inner = self.shared.inner.clone();
        let mut result: anyhow::Result<()> = Ok(());

        loop {
            if inner.should_stop() {
                break;
            }

            let loop_result: anyhow::Result<()> = tokio::select! {
                _ = tick.tick() => {
                    self.reconcile_dispatchers().await;
                    Ok(())
                }
                _ = inner.nudge.notified() => {
                    self.reconcile_dispatchers().await;
                    Ok(())
                }
                _ = inner.stopped() => Ok(()),
                Some(res) = self.dispatchers.join_next() => {
                    match res {
                        Ok(master_id) => {
                            self.dispatching.remove(&master_id);
                            Ok(())
                        }
                        Err(err) => Err(anyhow::anyhow!("dispatch task join error: {err}")),
                    }
                }
                Some(res) = self.background.join_next() => {
                    match res {
                        Ok(name) => Err(anyhow::anyhow!("{name} exited unexpectedly")),
                        Err(err) => Err(anyhow::anyhow!("background task join error: {err}")),
                    }
                }
            };

            if let Err(err) = loop_result {
                result = Err(err);
                break;
            }
            self.push_snapshot();
        }

        if let Err(err) = &result {
            self.emit(EngineEvent::Error {
                message: format!("engine error: {err:#}"),
            });
            inner.request_stop();
        }

        // Loops observe the stop flag; in-flight calls are allowed to finish.
        while self.dispatchers.join_next().await.is_some() {}
        while self.background.join_next().await.is_some() {}
        self.dispatching.clear();

        self.emit(EngineEvent::Stopped);
        self.push_snapshot();
        result
    }
}

pub(crate) fn start_engine(
    cfg: EngineConfig,
    store: TaskStore,
    backends: Backends,
    samples: Arc<dyn SampleSource>,
) -> EngineHandle {
    let (inner, snapshot_tx) = EngineInner::new();
    let inner = Arc::new(inner);
    let join = tokio::spawn(run_engine(
        inner.clone(),
        snapshot_tx,
        cfg,
        store,
        backends,
        samples,
    ));
    EngineHandle { inner, join }
}

async fn run_engine(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    mut cfg: EngineConfig,
    store: TaskStore,
    backends: Backends,
    samples: Arc<dyn SampleSource>,
) -> anyhow::Result<()> {
    if cfg.max_concurrency == 0 {
        cfg.max_concurrency = EngineConfig::DEFAULT_MAX_CONCURRENCY;
    }
    if cfg.dispatch_idle == Duration::ZERO {
        cfg.dispatch_idle = EngineConfig::DEFAULT_DISPATCH_IDLE;
    }
    if cfg.poll_tick == Duration::ZERO {
        cfg.poll_tick = EngineConfig::DEFAULT_POLL_TICK;
    }
    if cfg.health_tick == Duration::ZERO {
        cfg.health_tick = EngineConfig::DEFAULT_HEALTH_TICK;
    }
    if cfg.sweep_tick == Duration::ZERO {
        cfg.sweep_tick = EngineConfig::DEFAULT_SWEEP_TICK;
    }

    let shared = Arc::new(Shared::new(cfg, store, backends, samples, inner));
    EngineRuntime {
        shared,
        dispatchers: JoinSet::new(),
        dispatching: HashSet::new(),
        background: JoinSet::new(),
        snapshot_tx,
    }
    .run()
    .await
}
