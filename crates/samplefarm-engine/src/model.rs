//! Persisted entities and the two lifecycle state machines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use samplefarm_core::AnalyzerType;

/// Shape of a master task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Many samples.
    Batch,
    /// Exactly one sample.
    Single,
}

/// Master task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterTaskStatus {
    /// Created, not yet executed.
    Pending,
    /// Dispatching and/or polling.
    Running,
    /// Paused by an operator.
    Paused,
    /// All sub-tasks terminal, at least one succeeded.
    Completed,
    /// All sub-tasks terminal, none succeeded.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

/// Sub-task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubTaskStatus {
    /// Waiting for the dispatcher.
    Pending,
    /// Claimed, submission in flight.
    Submitting,
    /// Accepted by the backend.
    Submitted,
    /// Backend reports it is being analyzed.
    Analyzing,
    /// Paused with its master task.
    Paused,
    /// Result stored.
    Completed,
    /// Failed (possibly re-armed later).
    Failed,
    /// Cancelled with its master task.
    Cancelled,
}

macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// Stable lower-case name, as stored.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(UnknownStatus(other.to_string())),
                }
            }
        }
    };
}

/// A stored status string did not match any known state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0:?}")]
pub struct UnknownStatus(pub String);

status_strings!(TaskKind {
    Batch => "batch",
    Single => "single",
});

status_strings!(MasterTaskStatus {
    Pending => "pending",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

status_strings!(SubTaskStatus {
    Pending => "pending",
    Submitting => "submitting",
    Submitted => "submitted",
    Analyzing => "analyzing",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl MasterTaskStatus {
    /// `completed`, `failed` or `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MasterTaskStatus::Completed | MasterTaskStatus::Failed | MasterTaskStatus::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the master state machine.
    ///
    /// `completed|failed -> running` is the failed-task sweep reopening a batch.
    pub fn can_transition_to(self, to: MasterTaskStatus) -> bool {
        use MasterTaskStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Paused | Cancelled)
                | (Running, Paused | Completed | Failed | Cancelled)
                | (Paused, Running | Cancelled)
                | (Completed | Failed, Running)
        )
    }
}

impl SubTaskStatus {
    /// Every state, in display order.
    pub const ALL: [SubTaskStatus; 8] = [
        SubTaskStatus::Pending,
        SubTaskStatus::Submitting,
        SubTaskStatus::Submitted,
        SubTaskStatus::Analyzing,
        SubTaskStatus::Paused,
        SubTaskStatus::Completed,
        SubTaskStatus::Failed,
        SubTaskStatus::Cancelled,
    ];

    /// `completed`, `failed` or `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubTaskStatus::Completed | SubTaskStatus::Failed | SubTaskStatus::Cancelled
        )
    }

    /// Remote work outstanding (`submitted` or `analyzing`).
    pub fn is_outstanding(self) -> bool {
        matches!(self, SubTaskStatus::Submitted | SubTaskStatus::Analyzing)
    }

    /// Whether `self -> to` is an edge of the sub-task state machine.
    ///
    /// `paused -> failed` covers an in-flight call that failed for good after
    /// its batch was paused.
    pub fn can_transition_to(self, to: SubTaskStatus) -> bool {
        use SubTaskStatus::*;
        matches!(
            (self, to),
            (Pending, Submitting | Paused | Cancelled)
                | (Submitting, Submitted | Failed | Pending | Paused | Cancelled)
                | (Submitted, Analyzing | Completed | Failed | Paused | Cancelled)
                | (Analyzing, Completed | Failed | Paused | Cancelled)
                | (Paused, Pending | Submitting | Submitted | Analyzing | Failed | Cancelled)
                | (Failed, Pending)
        )
    }
}

/// Health of an analyzer instance as last probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceHealth {
    /// Last probe succeeded.
    Healthy,
    /// Last probe failed.
    Unhealthy,
    /// Never probed.
    Unknown,
}

status_strings!(InstanceHealth {
    Healthy => "healthy",
    Unhealthy => "unhealthy",
    Unknown => "unknown",
});

/// One batch analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterTask {
    /// Identifier.
    pub id: Uuid,
    /// Human name.
    pub name: String,
    /// Backend family of every sub-task.
    pub analyzer_type: AnalyzerType,
    /// Batch or single.
    pub task_type: TaskKind,
    /// Number of sub-tasks.
    pub total_samples: u32,
    /// Sub-tasks completed.
    pub completed_samples: u32,
    /// Sub-tasks failed or cancelled.
    pub failed_samples: u32,
    /// Lifecycle state.
    pub status: MasterTaskStatus,
    /// Terminal sub-tasks over total, 0..=100.
    pub progress: f64,
    /// Allow-list of instance ids (empty = any enabled instance of the family).
    pub instance_ids: Vec<Uuid>,
    /// Submission parameters shared by all sub-tasks.
    pub parameters: Option<serde_json::Value>,
    /// Execution config of the last batch-execute request.
    pub execution: Option<samplefarm_core::ExecutionConfig>,
    /// Filter used to select the samples, when created by filter.
    pub sample_filter: Option<serde_json::Value>,
    /// Free-form summary written when the batch is finalized.
    pub result_summary: Option<serde_json::Value>,
    /// When the batch was paused.
    pub paused_at: Option<DateTime<Utc>>,
    /// Why the batch was paused.
    pub pause_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// One sample's analysis unit within a master task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    /// Identifier.
    pub id: Uuid,
    /// Owning master task.
    pub master_task_id: Uuid,
    /// Opaque sample reference.
    pub sample_id: String,
    /// Backend family.
    pub analyzer_type: AnalyzerType,
    /// Instance the sample was submitted to.
    pub instance_id: Option<Uuid>,
    /// Remote task id.
    pub external_task_id: Option<String>,
    /// Lifecycle state.
    pub status: SubTaskStatus,
    /// State to restore on resume.
    pub paused_from: Option<SubTaskStatus>,
    /// Higher goes first.
    pub priority: i32,
    /// In-line retries consumed.
    pub retry_count: u32,
    /// Failed-task sweep re-arms consumed.
    pub sweep_count: u32,
    /// Whether the last failure was transient.
    pub failure_transient: bool,
    /// Earliest time the dispatcher (or poller) may touch this row again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Per-sample submission parameters.
    pub parameters: Option<serde_json::Value>,
    /// Last error message.
    pub error_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the backend accepted it.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// A configured backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerInstance {
    /// Identifier.
    pub id: Uuid,
    /// Unique name.
    pub name: String,
    /// Backend family.
    pub analyzer_type: AnalyzerType,
    /// Base URL.
    pub base_url: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Whether the instance receives work.
    pub enabled: bool,
    /// Per-request timeout.
    pub timeout_seconds: u64,
    /// Concurrent task cap (`0` = unlimited).
    pub max_concurrent_tasks: u32,
    /// Health probe interval.
    pub health_check_interval: u64,
    /// Last probed health.
    pub status: InstanceHealth,
    /// Time of the last probe.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl AnalyzerInstance {
    /// Per-request timeout as a duration.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds.max(1))
    }
}

/// Fields for creating or updating an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInstance {
    /// Unique name.
    pub name: String,
    /// Backend family.
    pub analyzer_type: AnalyzerType,
    /// Base URL.
    pub base_url: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Whether the instance receives work.
    pub enabled: bool,
    /// Per-request timeout.
    pub timeout_seconds: u64,
    /// Concurrent task cap (`0` = unlimited).
    pub max_concurrent_tasks: u32,
    /// Health probe interval.
    pub health_check_interval: u64,
}

impl NewInstance {
    /// An enabled instance with the family defaults.
    pub fn with_defaults(
        name: impl Into<String>,
        analyzer_type: AnalyzerType,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            analyzer_type,
            base_url: base_url.into(),
            description: None,
            enabled: true,
            timeout_seconds: analyzer_type.default_timeout_secs(),
            max_concurrent_tasks: analyzer_type.default_max_concurrent(),
            health_check_interval: analyzer_type.default_health_check_interval_secs(),
        }
    }
}

impl From<&samplefarm_core::config::InstanceSeed> for NewInstance {
    fn from(seed: &samplefarm_core::config::InstanceSeed) -> Self {
        let analyzer = seed.analyzer;
        Self {
            name: seed.name.clone(),
            analyzer_type: analyzer,
            base_url: seed.base_url.clone(),
            description: seed.description.clone(),
            enabled: seed.enabled,
            timeout_seconds: seed
                .timeout_seconds
                .unwrap_or_else(|| analyzer.default_timeout_secs()),
            max_concurrent_tasks: seed
                .max_concurrent_tasks
                .unwrap_or_else(|| analyzer.default_max_concurrent()),
            health_check_interval: seed
                .health_check_interval
                .unwrap_or_else(|| analyzer.default_health_check_interval_secs()),
        }
    }
}

/// Durable output of a completed sub-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Sub-task the result belongs to.
    pub sub_task_id: Uuid,
    /// Backend family (selects the result table).
    pub analyzer_type: AnalyzerType,
    /// Remote task id the result was fetched for.
    pub external_task_id: String,
    /// Extracted summary fields.
    pub summary: serde_json::Value,
    /// Full backend report.
    pub report: serde_json::Value,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// Per-state sub-task counts of one master task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// `pending`.
    pub pending: u32,
    /// `submitting`.
    pub submitting: u32,
    /// `submitted`.
    pub submitted: u32,
    /// `analyzing`.
    pub analyzing: u32,
    /// `paused`.
    pub paused: u32,
    /// `completed`.
    pub completed: u32,
    /// `failed`.
    pub failed: u32,
    /// `cancelled`.
    pub cancelled: u32,
}

impl StatusCounts {
    /// Add `n` sub-tasks in `status`.
    pub fn add(&mut self, status: SubTaskStatus, n: u32) {
        let slot = match status {
            SubTaskStatus::Pending => &mut self.pending,
            SubTaskStatus::Submitting => &mut self.submitting,
            SubTaskStatus::Submitted => &mut self.submitted,
            SubTaskStatus::Analyzing => &mut self.analyzing,
            SubTaskStatus::Paused => &mut self.paused,
            SubTaskStatus::Completed => &mut self.completed,
            SubTaskStatus::Failed => &mut self.failed,
            SubTaskStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    /// Sum over every state.
    pub fn total(&self) -> u32 {
        self.pending
            + self.submitting
            + self.submitted
            + self.analyzing
            + self.paused
            + self.completed
            + self.failed
            + self.cancelled
    }

    /// Sub-tasks in a terminal state.
    pub fn terminal(&self) -> u32 {
        self.completed + self.failed + self.cancelled
    }

    /// Terminal over total, as a percentage.
    pub fn progress_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.terminal() as f64 * 100.0 / total as f64 * 100.0).round() / 100.0
    }

    /// Status a master task should be finalized to, once every sub-task is terminal.
    pub fn final_status(&self) -> Option<MasterTaskStatus> {
        let total = self.total();
        if total == 0 || self.terminal() < total {
            return None;
        }
        if self.completed > 0 {
            Some(MasterTaskStatus::Completed)
        } else if self.cancelled == total {
            Some(MasterTaskStatus::Cancelled)
        } else {
            Some(MasterTaskStatus::Failed)
        }
    }
}

/// Aggregated progress of a master task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    /// Master task id.
    pub master_task_id: Uuid,
    /// Master task state.
    pub status: MasterTaskStatus,
    /// Number of sub-tasks.
    pub total_samples: u32,
    /// Per-state counts.
    pub counts: StatusCounts,
    /// Terminal over total, as a percentage.
    pub progress_percentage: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// Pause time, when paused.
    pub paused_at: Option<DateTime<Utc>>,
    /// Pause reason, when paused.
    pub pause_reason: Option<String>,
}

/// Ephemeral cached view of a sub-task's remote state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatusSnapshot {
    /// Sub-task id.
    pub sub_task_id: Uuid,
    /// Raw backend status string.
    pub raw_status: String,
    /// Last fetched payload.
    pub payload: serde_json::Value,
    /// Time of the fetch.
    pub fetched_at: DateTime<Utc>,
    /// Consecutive failed poll calls.
    pub poll_failures: u32,
    /// Last poll error, if the last call failed.
    pub last_error: Option<String>,
}

/// One stored result for a sample, with the batch it ran in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleAnalysis {
    /// Sub-task that produced the result.
    pub sub_task_id: Uuid,
    /// Batch the sub-task belongs to.
    pub master_task_id: Uuid,
    /// Batch name.
    pub master_name: String,
    /// Backend family.
    pub analyzer_type: AnalyzerType,
    /// Remote task id.
    pub external_task_id: String,
    /// CAPE malscore; absent for CFG.
    pub malscore: Option<f64>,
    /// Extracted summary fields.
    pub summary: serde_json::Value,
    /// When the result was stored.
    pub created_at: DateTime<Utc>,
}

/// Aggregate over every stored result of one sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    /// Stored results.
    pub total_analyses: u64,
    /// Mean malscore over results that carry one.
    pub average_malscore: Option<f64>,
    /// Highest malscore.
    pub max_malscore: Option<f64>,
    /// Newest result.
    pub latest_analysis: Option<DateTime<Utc>>,
}

/// Analysis history of one sample across batches, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleAnalysisHistory {
    /// Sample id.
    pub sample_id: String,
    /// Requested page of results.
    pub analyses: Page<SampleAnalysis>,
    /// Aggregate over all results, not just this page.
    pub stats: AnalysisStats,
}

/// Sub-task outcome statistics over a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    /// Start of the period; everything when absent.
    pub period_start: Option<DateTime<Utc>>,
    /// End of the period.
    pub period_end: DateTime<Utc>,
    /// Sub-tasks created in the period.
    pub total: u64,
    /// `completed`.
    pub completed: u64,
    /// `failed`.
    pub failed: u64,
    /// `cancelled`.
    pub cancelled: u64,
    /// Not yet terminal.
    pub outstanding: u64,
    /// Completed over completed plus failed, as a percentage.
    pub success_rate: f64,
    /// Mean seconds from remote start to completion of completed sub-tasks.
    pub average_duration_secs: Option<f64>,
}

/// A page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total matching items.
    pub total: u64,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub page_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_task_edges() {
        use SubTaskStatus::*;
        assert!(Pending.can_transition_to(Submitting));
        assert!(Submitting.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Paused.can_transition_to(Submitted));
        assert!(Paused.can_transition_to(Submitting));
        assert!(!Completed.can_transition_to(Submitting));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn terminal_sub_states_only_leave_through_retry() {
        for from in SubTaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in SubTaskStatus::ALL {
                let allowed = from == SubTaskStatus::Failed && to == SubTaskStatus::Pending;
                assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn master_edges() {
        use MasterTaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Failed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Paused));
    }

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for s in SubTaskStatus::ALL {
            assert_eq!(s.as_str().parse::<SubTaskStatus>().unwrap(), s);
        }
        assert!("done".parse::<MasterTaskStatus>().is_err());
    }

    #[test]
    fn counts_finalize_only_when_all_terminal() {
        let mut counts = StatusCounts::default();
        counts.add(SubTaskStatus::Completed, 2);
        counts.add(SubTaskStatus::Analyzing, 1);
        assert_eq!(counts.final_status(), None);
        assert_eq!(counts.progress_percentage(), 66.67);

        counts.analyzing = 0;
        counts.add(SubTaskStatus::Failed, 1);
        assert_eq!(counts.final_status(), Some(MasterTaskStatus::Completed));

        let mut failed = StatusCounts::default();
        failed.add(SubTaskStatus::Failed, 2);
        failed.add(SubTaskStatus::Cancelled, 1);
        assert_eq!(failed.final_status(), Some(MasterTaskStatus::Failed));
        assert_eq!(failed.progress_percentage(), 100.0);
    }
}
