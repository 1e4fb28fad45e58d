use chrono::Utc;
use uuid::Uuid;

use crate::store::{StoreError, TaskStore};

/// Stop scheduling a batch. In-flight calls finish; their outcome lands on
/// the paused sub-task and takes effect on resume. Returns the number of
/// sub-tasks paused.
pub(crate) async fn pause(
    store: &TaskStore,
    master_id: Uuid,
    reason: Option<String>,
) -> Result<u32, StoreError> {
    let why = reason.clone();
    let paused = store
        .call(move |s| s.pause_master(master_id, why.as_deref(), Utc::now()))
        .await?;
    tracing::info!(
        master_task_id = %master_id,
        sub_tasks = paused,
        reason = reason.as_deref().unwrap_or(""),
        "batch paused"
    );
    Ok(paused)
}

/// Restore a paused batch. Sub-tasks go back to the state they were paused
/// from; the dispatcher and poller pick them up on their next cycle.
pub(crate) async fn resume(store: &TaskStore, master_id: Uuid) -> Result<u32, StoreError> {
    let resumed = store
        .call(move |s| s.resume_master(master_id, Utc::now()))
        .await?;
    tracing::info!(master_task_id = %master_id, sub_tasks = resumed, "batch resumed");
    Ok(resumed)
}

/// Cancel a batch and every sub-task that has not finished. Remote tasks
/// already submitted are left to run.
pub(crate) async fn cancel(store: &TaskStore, master_id: Uuid) -> Result<u32, StoreError> {
    let cancelled = store
        .call(move |s| s.cancel_master(master_id, Utc::now()))
        .await?;
    tracing::info!(master_task_id = %master_id, sub_tasks = cancelled, "batch cancelled");
    Ok(cancelled)
}
