//! Caller-facing operations over the durable store.
//!
//! Every operation validates its preconditions before touching the store and
//! returns a typed [`ServiceError`]; a failed operation leaves no partial
//! state behind. The engine picks up state changes on its own schedule; a
//! caller that shares a process with it can [`crate::EngineHandle::nudge`] it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use samplefarm_core::ExecutionConfig;
use samplefarm_core::config::InstanceSeed;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    AnalysisResult, AnalyzerInstance, AnalyzerType, MasterTask, NewInstance, Page, RuntimeStatus,
    SampleAnalysisHistory, SubTask, TaskKind, TaskStatistics,
};
use crate::preview::TaskPreview;
use crate::samples::{SampleError, SampleFilter, SampleSource};
use crate::store::{
    MasterQuery, NewMasterTask, StatsQuery, StoreError, SubTaskQuery, TaskStore,
};

/// Failure of a caller-facing operation.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The entity is in a state that does not allow the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The request itself is malformed.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The sample collaborator failed.
    #[error(transparent)]
    Samples(#[from] SampleError),
    /// The store failed.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ServiceError::NotFound(err.to_string()),
            StoreError::InvalidTransition { .. } | StoreError::InUse(_) => {
                ServiceError::InvalidState(err.to_string())
            }
            StoreError::Duplicate(_) => ServiceError::Validation(err.to_string()),
            other => ServiceError::Store(other),
        }
    }
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::Validation(message.into())
}

/// How the samples of a new master task are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSelection {
    /// Explicit sample ids.
    Ids(Vec<String>),
    /// Every catalog sample matching the filter.
    Filter(SampleFilter),
}

/// Create-master-task request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMasterTask {
    /// Human name.
    pub name: String,
    /// Backend family.
    pub analyzer: AnalyzerType,
    /// Batch or single.
    pub kind: TaskKind,
    /// Samples to analyze.
    pub samples: SampleSelection,
    /// Instance allow-list; empty allows every instance of the family.
    #[serde(default)]
    pub instance_ids: Vec<Uuid>,
    /// Extra submission parameters.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    /// Dispatch priority, highest first.
    #[serde(default)]
    pub priority: i32,
}

/// Batch-execute request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExecute {
    /// Batch to start or reconfigure.
    pub master_task_id: Uuid,
    /// Execution parameters, persisted on the batch.
    pub execution: ExecutionConfig,
}

/// Caller-facing operations.
#[derive(Clone)]
pub struct TaskService {
    store: TaskStore,
    samples: Arc<dyn SampleSource>,
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl TaskService {
    /// Service over `store`, resolving samples through `samples`.
    pub fn new(store: TaskStore, samples: Arc<dyn SampleSource>) -> Self {
        Self { store, samples }
    }

    /// Underlying store.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Validate ids: non-empty, no duplicates, all known to the catalog.
    async fn check_ids(&self, ids: &[String]) -> Result<(), ServiceError> {
        let mut seen = HashSet::new();
        for id in ids {
            let id = id.trim();
            if id.is_empty() {
                return Err(invalid("sample ids must not be empty"));
            }
            if !seen.insert(id) {
                return Err(invalid(format!("sample {id} listed more than once")));
            }
        }
        for id in ids {
            if !self.samples.contains(id).await? {
                return Err(invalid(format!("unknown sample {id}")));
            }
        }
        Ok(())
    }

    /// Create a master task and one `pending` sub-task per sample.
    pub async fn create_master_task(
        &self,
        req: CreateMasterTask,
    ) -> Result<MasterTask, ServiceError> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(invalid("name must not be empty"));
        }

        let (sample_ids, sample_filter) = match req.samples {
            SampleSelection::Ids(ids) => {
                self.check_ids(&ids).await?;
                (ids, None)
            }
            SampleSelection::Filter(filter) => {
                let ids = self.samples.select(&filter).await?;
                let filter = serde_json::to_value(&filter)
                    .map_err(|e| invalid(format!("sample filter: {e}")))?;
                (ids, Some(filter))
            }
        };
        if sample_ids.is_empty() {
            return Err(invalid("at least one sample is required"));
        }
        if req.kind == TaskKind::Single && sample_ids.len() != 1 {
            return Err(invalid(format!(
                "a single task takes exactly one sample, got {}",
                sample_ids.len()
            )));
        }
        self.check_instances(req.analyzer, &req.instance_ids).await?;

        let new = NewMasterTask {
            name,
            analyzer_type: req.analyzer,
            task_type: req.kind,
            sample_ids,
            instance_ids: req.instance_ids,
            parameters: req.parameters,
            sample_filter,
            priority: req.priority,
        };
        let master = self
            .store
            .call(move |s| s.create_master_task(&new, Utc::now()))
            .await?;
        tracing::info!(
            master_task_id = %master.id,
            analyzer = %master.analyzer_type,
            samples = master.total_samples,
            "master task created"
        );
        Ok(master)
    }

    async fn check_instances(
        &self,
        analyzer: AnalyzerType,
        instance_ids: &[Uuid],
    ) -> Result<(), ServiceError> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let known = self
            .store
            .call(move |s| s.list_instances(Some(analyzer)))
            .await?;
        for id in instance_ids {
            if !known.iter().any(|i| i.id == *id) {
                return Err(invalid(format!("instance {id} is not a {analyzer} instance")));
            }
        }
        Ok(())
    }

    /// Add samples to a non-terminal batch. Returns the number added.
    pub async fn add_samples(
        &self,
        master_id: Uuid,
        sample_ids: Vec<String>,
        priority: i32,
    ) -> Result<u32, ServiceError> {
        if sample_ids.is_empty() {
            return Err(invalid("at least one sample is required"));
        }
        let master = self.master_detail(master_id).await?;
        if master.task_type == TaskKind::Single {
            return Err(ServiceError::InvalidState(format!(
                "master task {master_id} is a single-sample task"
            )));
        }
        self.check_ids(&sample_ids).await?;
        let added = self
            .store
            .call(move |s| s.add_samples(master_id, &sample_ids, priority, Utc::now()))
            .await?;
        tracing::info!(master_task_id = %master_id, added, "samples added");
        Ok(added)
    }

    /// Start a `pending` batch, or replace the execution parameters of a
    /// `running` one.
    pub async fn batch_execute(&self, req: BatchExecute) -> Result<MasterTask, ServiceError> {
        req.execution
            .validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        let BatchExecute {
            master_task_id,
            execution,
        } = req;
        let master = self
            .store
            .call(move |s| s.start_master(master_task_id, &execution, Utc::now()))
            .await?;
        tracing::info!(master_task_id = %master.id, "batch execution started");
        Ok(master)
    }

    /// Pause a `pending` or `running` batch.
    pub async fn pause(&self, master_id: Uuid, reason: Option<String>) -> Result<u32, ServiceError> {
        Ok(crate::control::pause(&self.store, master_id, reason).await?)
    }

    /// Resume a paused batch.
    pub async fn resume(&self, master_id: Uuid) -> Result<u32, ServiceError> {
        Ok(crate::control::resume(&self.store, master_id).await?)
    }

    /// Cancel a batch that has not finished.
    pub async fn cancel(&self, master_id: Uuid) -> Result<u32, ServiceError> {
        Ok(crate::control::cancel(&self.store, master_id).await?)
    }

    /// One master task.
    pub async fn master_detail(&self, master_id: Uuid) -> Result<MasterTask, ServiceError> {
        Ok(self.store.call(move |s| s.master_task(master_id)).await?)
    }

    /// Master tasks, newest first.
    pub async fn list_master_tasks(
        &self,
        query: MasterQuery,
    ) -> Result<Page<MasterTask>, ServiceError> {
        Ok(self.store.call(move |s| s.list_master_tasks(&query)).await?)
    }

    /// Sub-tasks of a batch in dispatch order.
    pub async fn list_sub_tasks(
        &self,
        master_id: Uuid,
        query: SubTaskQuery,
    ) -> Result<Page<SubTask>, ServiceError> {
        Ok(self
            .store
            .call(move |s| s.list_sub_tasks(master_id, &query))
            .await?)
    }

    /// Per-state counts and progress, computed from the sub-task table.
    pub async fn runtime_status(&self, master_id: Uuid) -> Result<RuntimeStatus, ServiceError> {
        Ok(self.store.call(move |s| s.runtime_status(master_id)).await?)
    }

    /// Stored result of a completed sub-task.
    pub async fn analysis_result(&self, sub_task_id: Uuid) -> Result<AnalysisResult, ServiceError> {
        self.store
            .call(move |s| s.analysis_result(sub_task_id))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("no result for sub-task {sub_task_id}")))
    }

    /// Summarize the samples `filter` selects, without creating anything.
    pub async fn preview(
        &self,
        analyzer: AnalyzerType,
        filter: SampleFilter,
    ) -> Result<TaskPreview, ServiceError> {
        let records = self.samples.records(&filter).await?;
        let eligible = self
            .store
            .call(move |s| s.list_instances(Some(analyzer)))
            .await?
            .iter()
            .filter(|i| i.enabled)
            .count();
        Ok(TaskPreview::from_records(
            analyzer,
            &records,
            u32::try_from(eligible).unwrap_or(u32::MAX),
        ))
    }

    /// Every stored result of one sample across batches, newest first.
    pub async fn sample_analysis_history(
        &self,
        sample_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<SampleAnalysisHistory, ServiceError> {
        let sample_id = sample_id.trim().to_string();
        if sample_id.is_empty() {
            return Err(invalid("sample id must not be empty"));
        }
        if !self.samples.contains(&sample_id).await? {
            return Err(ServiceError::NotFound(format!("sample {sample_id}")));
        }
        let id = sample_id.clone();
        let (analyses, stats) = self
            .store
            .call(move |s| s.sample_history(&id, page, page_size))
            .await?;
        Ok(SampleAnalysisHistory {
            sample_id,
            analyses,
            stats,
        })
    }

    /// Sub-task outcome statistics, optionally limited to a family, an
    /// instance or the last `days` days.
    pub async fn task_statistics(
        &self,
        analyzer: Option<AnalyzerType>,
        instance_id: Option<Uuid>,
        days: Option<u32>,
    ) -> Result<TaskStatistics, ServiceError> {
        if days == Some(0) {
            return Err(invalid("days must be >= 1"));
        }
        if let Some(id) = instance_id {
            self.store.call(move |s| s.instance(id)).await?;
        }
        let now = Utc::now();
        let query = StatsQuery {
            analyzer_type: analyzer,
            instance_id,
            since: days.map(|d| now - chrono::Duration::days(i64::from(d))),
        };
        Ok(self
            .store
            .call(move |s| s.task_statistics(&query, now))
            .await?)
    }

    /// Delete a terminal batch with its sub-tasks and results.
    pub async fn delete_master_task(&self, master_id: Uuid) -> Result<(), ServiceError> {
        self.store.call(move |s| s.delete_master(master_id)).await?;
        tracing::info!(master_task_id = %master_id, "master task deleted");
        Ok(())
    }

    /// Register an analyzer instance.
    pub async fn add_instance(&self, new: NewInstance) -> Result<AnalyzerInstance, ServiceError> {
        check_instance(&new)?;
        let inst = self
            .store
            .call(move |s| s.add_instance(&new, Utc::now()))
            .await?;
        tracing::info!(instance_id = %inst.id, name = %inst.name, "instance added");
        Ok(inst)
    }

    /// Upsert the instances listed in configuration, by name.
    pub async fn seed_instances(
        &self,
        seeds: &[InstanceSeed],
    ) -> Result<Vec<AnalyzerInstance>, ServiceError> {
        let mut out = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let new = NewInstance::from(seed);
            check_instance(&new)?;
            out.push(
                self.store
                    .call(move |s| s.upsert_instance(&new, Utc::now()))
                    .await?,
            );
        }
        Ok(out)
    }

    /// Instances, optionally of one family.
    pub async fn list_instances(
        &self,
        analyzer: Option<AnalyzerType>,
    ) -> Result<Vec<AnalyzerInstance>, ServiceError> {
        Ok(self.store.call(move |s| s.list_instances(analyzer)).await?)
    }

    /// Enable or disable an instance.
    pub async fn set_instance_enabled(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> Result<AnalyzerInstance, ServiceError> {
        Ok(self
            .store
            .call(move |s| s.set_instance_enabled(id, enabled, Utc::now()))
            .await?)
    }

    /// Remove an instance with no live work.
    pub async fn remove_instance(&self, id: Uuid) -> Result<(), ServiceError> {
        self.store.call(move |s| s.remove_instance(id)).await?;
        tracing::info!(instance_id = %id, "instance removed");
        Ok(())
    }
}

fn check_instance(new: &NewInstance) -> Result<(), ServiceError> {
    if new.name.trim().is_empty() {
        return Err(invalid("instance name must not be empty"));
    }
    let url = new.base_url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(invalid(format!(
            "instance {}: base_url must start with http:// or https://",
            new.name
        )));
    }
    if new.timeout_seconds == 0 {
        return Err(invalid(format!("instance {}: timeout_seconds must be > 0", new.name)));
    }
    Ok(())
}
