//! Public API types for the in-process orchestration engine.

use std::sync::Arc;
use std::time::Duration;

use samplefarm_core::config::OrchestratorConfig;
use samplefarm_core::{ExecutionConfig, RecoveryConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::Backends;
use crate::model::{InstanceHealth, MasterTaskStatus, RuntimeStatusSnapshot};
use crate::recovery::{RecoveryStats, SweepStats};
use crate::samples::SampleSource;
use crate::store::TaskStore;

/// Configuration for the in-process engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global cap on concurrent submissions and polls.
    pub max_concurrency: usize,

    /// Sleep of an idle per-batch dispatch loop.
    pub dispatch_idle: Duration,

    /// Poller wake-up tick. Each batch still honors its own poll interval.
    pub poll_tick: Duration,

    /// Health checker wake-up tick. Each instance is probed on its own
    /// interval.
    pub health_tick: Duration,

    /// Failed-task sweep tick.
    pub sweep_tick: Duration,

    /// Startup recovery scanner.
    pub recovery: RecoveryConfig,

    /// Execution parameters for batches started without their own.
    pub default_execution: ExecutionConfig,
}

impl EngineConfig {
    /// Default global concurrency.
    pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

    /// Default idle sleep of a dispatch loop.
    pub const DEFAULT_DISPATCH_IDLE: Duration = Duration::from_secs(1);

    /// Default poller tick.
    pub const DEFAULT_POLL_TICK: Duration = Duration::from_secs(1);

    /// Default health checker tick.
    pub const DEFAULT_HEALTH_TICK: Duration = Duration::from_secs(5);

    /// Default sweep tick.
    pub const DEFAULT_SWEEP_TICK: Duration = Duration::from_secs(300);

    /// Engine settings from the on-disk configuration.
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_concurrency: cfg.engine.max_concurrency,
            dispatch_idle: Duration::from_millis(cfg.engine.dispatch_idle_ms),
            poll_tick: Duration::from_millis(cfg.engine.poll_tick_ms),
            health_tick: Duration::from_secs(cfg.engine.health_tick_secs),
            sweep_tick: Duration::from_secs(cfg.engine.sweep_tick_secs),
            recovery: cfg.recovery.clone(),
            default_execution: cfg.execution.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: Self::DEFAULT_MAX_CONCURRENCY,
            dispatch_idle: Self::DEFAULT_DISPATCH_IDLE,
            poll_tick: Self::DEFAULT_POLL_TICK,
            health_tick: Self::DEFAULT_HEALTH_TICK,
            sweep_tick: Self::DEFAULT_SWEEP_TICK,
            recovery: RecoveryConfig::default(),
            default_execution: ExecutionConfig::default(),
        }
    }
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Engine is stopping (graceful shutdown requested).
    StopRequested,
    /// A dispatch loop started for a running batch.
    DispatchStarted {
        /// Batch id.
        master_task_id: Uuid,
    },
    /// A sample was accepted by a backend.
    SubTaskSubmitted {
        /// Batch id.
        master_task_id: Uuid,
        /// Sub-task id.
        sub_task_id: Uuid,
        /// Instance used.
        instance_id: Uuid,
        /// Remote task id.
        external_task_id: String,
    },
    /// A result was stored.
    SubTaskCompleted {
        /// Batch id.
        master_task_id: Uuid,
        /// Sub-task id.
        sub_task_id: Uuid,
    },
    /// A submission or remote analysis failed.
    SubTaskFailed {
        /// Batch id.
        master_task_id: Uuid,
        /// Sub-task id.
        sub_task_id: Uuid,
        /// Error message.
        error: String,
        /// Whether a retry was scheduled.
        will_retry: bool,
    },
    /// Every sub-task of a batch reached a terminal state.
    MasterFinalized {
        /// Batch id.
        master_task_id: Uuid,
        /// Final state.
        status: MasterTaskStatus,
    },
    /// A health probe changed an instance's state.
    InstanceHealthChanged {
        /// Instance id.
        instance_id: Uuid,
        /// Instance name.
        name: String,
        /// New state.
        status: InstanceHealth,
    },
    /// A recovery scan finished.
    RecoveryCompleted {
        /// What the scan changed.
        stats: RecoveryStats,
    },
    /// A failed-task sweep re-armed sub-tasks.
    SweepCompleted {
        /// What the sweep changed.
        stats: SweepStats,
    },
    /// A warning from the engine.
    Warning {
        /// Warning message.
        message: String,
    },
    /// A non-fatal error from the engine.
    Error {
        /// Error message.
        message: String,
    },
    /// Engine stopped (no more loops running).
    Stopped,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Whether the engine has been asked to stop.
    pub stop_requested: bool,
    /// Batches with a live dispatch loop.
    pub dispatching: Vec<Uuid>,
    /// Sub-tasks with a cached remote status.
    pub tracked_remote: usize,
    /// Submissions claimed by this process and not yet recorded.
    pub submitting: usize,
    /// Outcome of the most recent recovery scan.
    pub last_recovery: Option<RecoveryStats>,
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new in-process engine instance on `store`.
pub fn start_engine(
    config: EngineConfig,
    store: TaskStore,
    backends: Backends,
    samples: Arc<dyn SampleSource>,
) -> EngineHandle {
    crate::engine::start_engine(config, store, backends, samples)
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Last polled remote state of an outstanding sub-task, if tracked.
    pub fn remote_status(&self, sub_task_id: Uuid) -> Option<RuntimeStatusSnapshot> {
        self.inner.snapshots.get(sub_task_id)
    }

    /// Wake the supervisor so a newly started or resumed batch is picked up
    /// without waiting for the next tick.
    pub fn nudge(&self) {
        self.inner.nudge.notify_one();
    }

    /// Request a graceful shutdown (finish in-flight calls, stop scheduling).
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}
