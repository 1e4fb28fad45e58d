use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use samplefarm_core::{ExecutionConfig, FailedTaskRetryPolicy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    MASTER_COLUMNS, SUB_COLUMNS, StoreError, TaskStore, col_json_opt, col_parse, col_ts,
    invalid_transition, json_text, master_from_row, sub_task_from_row, ts,
};
use crate::model::{
    AnalysisResult, AnalyzerType, MasterTask, MasterTaskStatus, Page, RuntimeStatus,
    StatusCounts, SubTask, SubTaskStatus, TaskKind,
};

/// Fields for a new master task and its sub-tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMasterTask {
    /// Human name.
    pub name: String,
    /// Backend family.
    pub analyzer_type: AnalyzerType,
    /// Batch or single.
    pub task_type: TaskKind,
    /// One sub-task per sample id.
    pub sample_ids: Vec<String>,
    /// Instance allow-list.
    pub instance_ids: Vec<Uuid>,
    /// Submission parameters.
    pub parameters: Option<serde_json::Value>,
    /// Filter that produced `sample_ids`, if any.
    pub sample_filter: Option<serde_json::Value>,
    /// Priority of every created sub-task.
    pub priority: i32,
}

/// Master task listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterQuery {
    /// Restrict to one state.
    pub status: Option<MasterTaskStatus>,
    /// Restrict to one family.
    pub analyzer_type: Option<AnalyzerType>,
    /// 1-based page.
    pub page: u32,
    /// Page size (clamped to 1..=500).
    pub page_size: u32,
}

/// Sub-task listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskQuery {
    /// Restrict to one state.
    pub status: Option<SubTaskStatus>,
    /// Substring of sample id, external task id or error message.
    pub keyword: Option<String>,
    /// 1-based page.
    pub page: u32,
    /// Page size (clamped to 1..=500).
    pub page_size: u32,
}

/// A failed sub-task the sweep may re-arm, with its batch policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepCandidate {
    /// The failed sub-task.
    pub sub_task: SubTask,
    /// Sweep policy of the owning batch.
    pub policy: FailedTaskRetryPolicy,
}

/// A page of outstanding sub-tasks from [`TaskStore::list_outstanding`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutstandingPage {
    /// Sub-tasks on this page.
    pub items: Vec<SubTask>,
    /// Cursor for the next page; `None` once the set is exhausted.
    pub next: Option<i64>,
}

pub(super) fn page_bounds(page: u32, page_size: u32) -> (u32, u32, i64) {
    let page = page.max(1);
    let page_size = if page_size == 0 { 20 } else { page_size.min(500) };
    let offset = i64::from(page - 1) * i64::from(page_size);
    (page, page_size, offset)
}

fn load_master(tx: &rusqlite::Connection, id: Uuid) -> Result<MasterTask, StoreError> {
    tx.query_row(
        &format!("SELECT {MASTER_COLUMNS} FROM master_tasks WHERE id = ?1"),
        params![id.to_string()],
        master_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("master task", id))
}

fn load_sub_task(tx: &rusqlite::Connection, id: Uuid) -> Result<SubTask, StoreError> {
    tx.query_row(
        &format!("SELECT {SUB_COLUMNS} FROM sub_tasks WHERE id = ?1"),
        params![id.to_string()],
        sub_task_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("sub-task", id))
}

fn counts_for(tx: &rusqlite::Connection, master_id: Uuid) -> Result<StatusCounts, StoreError> {
    let mut stmt = tx.prepare_cached(
        "SELECT status, count(*) FROM sub_tasks WHERE master_task_id = ?1 GROUP BY status",
    )?;
    let rows = stmt.query_map(params![master_id.to_string()], |row| {
        Ok((col_parse::<SubTaskStatus>(row, "status")?, row.get::<_, u32>(1)?))
    })?;
    let mut counts = StatusCounts::default();
    for row in rows {
        let (status, n) = row?;
        counts.add(status, n);
    }
    Ok(counts)
}

fn set_master_status(
    tx: &Transaction<'_>,
    master: &MasterTask,
    to: MasterTaskStatus,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if !master.status.can_transition_to(to) {
        return Err(invalid_transition("master task", master.id, master.status, to));
    }
    tx.execute(
        "UPDATE master_tasks SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = ?4",
        params![master.id.to_string(), to.as_str(), ts(now), master.status.as_str()],
    )?;
    Ok(())
}

/// Recompute counts and progress; finalize a running batch once every
/// sub-task is terminal. Returns the new terminal status when it finalized.
fn rollup(
    tx: &Transaction<'_>,
    master_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<MasterTaskStatus>, StoreError> {
    let master = load_master(tx, master_id)?;
    let counts = counts_for(tx, master_id)?;

    tx.execute(
        "UPDATE master_tasks
         SET total_samples = ?2, completed_samples = ?3, failed_samples = ?4, progress = ?5
         WHERE id = ?1",
        params![
            master_id.to_string(),
            counts.total(),
            counts.completed,
            counts.failed + counts.cancelled,
            counts.progress_percentage(),
        ],
    )?;

    if master.status != MasterTaskStatus::Running {
        return Ok(None);
    }
    let Some(final_status) = counts.final_status() else {
        return Ok(None);
    };

    set_master_status(tx, &master, final_status, now)?;
    let summary = serde_json::json!({
        "completed": counts.completed,
        "failed": counts.failed,
        "cancelled": counts.cancelled,
        "finished_at": ts(now),
    });
    tx.execute(
        "UPDATE master_tasks SET result_summary = ?2 WHERE id = ?1",
        params![master_id.to_string(), summary.to_string()],
    )?;
    Ok(Some(final_status))
}

impl TaskStore {
    /// Create a master task and one `pending` sub-task per sample, atomically.
    pub fn create_master_task(
        &self,
        new: &NewMasterTask,
        now: DateTime<Utc>,
    ) -> Result<MasterTask, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let id = Uuid::new_v4();
        let instance_ids = serde_json::to_string(&new.instance_ids)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        tx.execute(
            "INSERT INTO master_tasks
             (id, name, analyzer_type, task_type, total_samples, status, instance_ids,
              parameters, sample_filter, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?9)",
            params![
                id.to_string(),
                new.name,
                new.analyzer_type.as_str(),
                new.task_type.as_str(),
                new.sample_ids.len() as u32,
                instance_ids,
                json_text(new.parameters.as_ref()),
                json_text(new.sample_filter.as_ref()),
                ts(now),
            ],
        )?;
        insert_sub_tasks(&tx, id, new.analyzer_type, &new.sample_ids, new.priority, false, now)?;

        let master = load_master(&tx, id)?;
        tx.commit()?;
        Ok(master)
    }

    /// Add samples to a non-terminal master task. A sample already present
    /// rejects the whole call. Samples added to a paused batch start paused
    /// and resume as `pending`.
    pub fn add_samples(
        &self,
        master_id: Uuid,
        sample_ids: &[String],
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let master = load_master(&tx, master_id)?;
        if master.status.is_terminal() {
            return Err(invalid_transition(
                "master task",
                master_id,
                master.status,
                "add samples",
            ));
        }
        let paused = master.status == MasterTaskStatus::Paused;
        insert_sub_tasks(&tx, master_id, master.analyzer_type, sample_ids, priority, paused, now)?;
        tx.execute(
            "UPDATE master_tasks SET updated_at = ?2 WHERE id = ?1",
            params![master_id.to_string(), ts(now)],
        )?;
        rollup(&tx, master_id, now)?;
        tx.commit()?;
        Ok(sample_ids.len() as u32)
    }

    /// Fetch one master task.
    pub fn master_task(&self, id: Uuid) -> Result<MasterTask, StoreError> {
        let conn = self.lock()?;
        load_master(&conn, id)
    }

    /// List master tasks, newest first.
    pub fn list_master_tasks(&self, query: &MasterQuery) -> Result<Page<MasterTask>, StoreError> {
        let conn = self.lock()?;
        let (page, page_size, offset) = page_bounds(query.page, query.page_size);
        let status = query.status.map(|s| s.as_str());
        let analyzer = query.analyzer_type.map(|a| a.as_str());

        let total: i64 = conn.query_row(
            "SELECT count(*) FROM master_tasks
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR analyzer_type = ?2)",
            params![status, analyzer],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MASTER_COLUMNS} FROM master_tasks
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR analyzer_type = ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let items = stmt
            .query_map(params![status, analyzer, page_size, offset], master_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page,
            page_size,
        })
    }

    /// Ids of master tasks in any of `statuses`, oldest first.
    pub fn master_ids_with_status(
        &self,
        statuses: &[MasterTaskStatus],
    ) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT id, status FROM master_tasks ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                super::col_uuid(row, "id")?,
                col_parse::<MasterTaskStatus>(row, "status")?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, status) = row?;
            if statuses.contains(&status) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Start (`pending -> running`) or reconfigure (`running`) a batch.
    pub fn start_master(
        &self,
        master_id: Uuid,
        execution: &ExecutionConfig,
        now: DateTime<Utc>,
    ) -> Result<MasterTask, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let master = load_master(&tx, master_id)?;
        match master.status {
            MasterTaskStatus::Pending => {
                set_master_status(&tx, &master, MasterTaskStatus::Running, now)?
            }
            MasterTaskStatus::Running => {}
            other => {
                return Err(invalid_transition(
                    "master task",
                    master_id,
                    other,
                    MasterTaskStatus::Running,
                ));
            }
        }
        let execution =
            serde_json::to_string(execution).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        tx.execute(
            "UPDATE master_tasks SET execution = ?2, updated_at = ?3 WHERE id = ?1",
            params![master_id.to_string(), execution, ts(now)],
        )?;
        let master = load_master(&tx, master_id)?;
        tx.commit()?;
        Ok(master)
    }

    /// Claim the next eligible `pending` sub-task of a running batch for
    /// `instance_id` (`pending -> submitting`).
    ///
    /// Order: priority (highest first), then creation order. Rows whose retry
    /// gate lies in the future are skipped.
    pub fn claim_next_pending(
        &self,
        master_id: Uuid,
        instance_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<SubTask>, StoreError> {
        Ok(self
            .claim_next_pending_with(master_id, instance_id, now, |_| ())?
            .map(|(sub, ())| sub))
    }

    /// [`Self::claim_next_pending`], calling `on_claim` with the claimed id
    /// before the transaction commits.
    pub fn claim_next_pending_with<T>(
        &self,
        master_id: Uuid,
        instance_id: Uuid,
        now: DateTime<Utc>,
        on_claim: impl FnOnce(Uuid) -> T,
    ) -> Result<Option<(SubTask, T)>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let master = load_master(&tx, master_id)?;
        if master.status != MasterTaskStatus::Running {
            return Ok(None);
        }

        let next: Option<String> = tx
            .query_row(
                "SELECT id FROM sub_tasks
                 WHERE master_task_id = ?1 AND status = 'pending'
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT 1",
                params![master_id.to_string(), ts(now)],
                |r| r.get(0),
            )
            .optional()?;
        let Some(sub_id) = next else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE sub_tasks
             SET status = 'submitting', instance_id = ?2, next_attempt_at = NULL, updated_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![sub_id, instance_id.to_string(), ts(now)],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let sub_id = Uuid::parse_str(&sub_id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let sub = load_sub_task(&tx, sub_id)?;
        let token = on_claim(sub_id);
        tx.commit()?;
        Ok(Some((sub, token)))
    }

    /// Earliest retry gate among `pending` sub-tasks of a batch.
    pub fn next_retry_gate(&self, master_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn.query_row(
            "SELECT min(next_attempt_at) FROM sub_tasks
             WHERE master_task_id = ?1 AND status = 'pending' AND next_attempt_at IS NOT NULL",
            params![master_id.to_string()],
            |r| r.get(0),
        )?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt(e.to_string()))
        })
        .transpose()
    }

    /// Record a successful submission (`submitting -> submitted`).
    ///
    /// A sub-task paused mid-submission stays paused and will resume as
    /// `submitted`. Any other current state is a duplicate submission.
    pub fn record_submitted(
        &self,
        sub_id: Uuid,
        external_task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubTaskStatus, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let sub = load_sub_task(&tx, sub_id)?;

        let status = match (sub.status, sub.paused_from) {
            (SubTaskStatus::Submitting, _) => {
                tx.execute(
                    "UPDATE sub_tasks
                     SET status = 'submitted', external_task_id = ?2, started_at = ?3,
                         error_message = NULL, updated_at = ?3
                     WHERE id = ?1 AND status = 'submitting'",
                    params![sub_id.to_string(), external_task_id, ts(now)],
                )?;
                SubTaskStatus::Submitted
            }
            (SubTaskStatus::Paused, Some(SubTaskStatus::Submitting)) => {
                tx.execute(
                    "UPDATE sub_tasks
                     SET paused_from = 'submitted', external_task_id = ?2, started_at = ?3,
                         error_message = NULL, updated_at = ?3
                     WHERE id = ?1 AND status = 'paused'",
                    params![sub_id.to_string(), external_task_id, ts(now)],
                )?;
                SubTaskStatus::Paused
            }
            (SubTaskStatus::Cancelled, _) => {
                tx.execute(
                    "UPDATE sub_tasks SET external_task_id = ?2, updated_at = ?3 WHERE id = ?1",
                    params![sub_id.to_string(), external_task_id, ts(now)],
                )?;
                SubTaskStatus::Cancelled
            }
            (from, _) => {
                tracing::error!(
                    sub_task_id = %sub_id,
                    external_task_id,
                    "invariant violation: duplicate submission"
                );
                return Err(invalid_transition(
                    "sub-task",
                    sub_id,
                    from,
                    SubTaskStatus::Submitted,
                ));
            }
        };
        tx.commit()?;
        Ok(status)
    }

    /// Record a failure. With `retry_at`, the sub-task is re-armed as
    /// `pending` behind that gate and its retry count is incremented;
    /// without, it ends `failed`.
    pub fn record_failure(
        &self,
        sub_id: Uuid,
        error: &str,
        transient: bool,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<SubTaskStatus, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let sub = load_sub_task(&tx, sub_id)?;

        let paused = sub.status == SubTaskStatus::Paused;
        if !paused && !sub.status.can_transition_to(SubTaskStatus::Failed) {
            return Err(invalid_transition(
                "sub-task",
                sub_id,
                sub.status,
                SubTaskStatus::Failed,
            ));
        }

        let status = match (retry_at, paused) {
            (Some(at), false) => {
                tx.execute(
                    "UPDATE sub_tasks
                     SET status = 'pending', retry_count = retry_count + 1, next_attempt_at = ?2,
                         error_message = ?3, failure_transient = ?4, instance_id = NULL,
                         external_task_id = NULL, started_at = NULL, updated_at = ?5
                     WHERE id = ?1",
                    params![sub_id.to_string(), ts(at), error, transient, ts(now)],
                )?;
                SubTaskStatus::Pending
            }
            (Some(at), true) => {
                tx.execute(
                    "UPDATE sub_tasks
                     SET paused_from = 'pending', retry_count = retry_count + 1,
                         next_attempt_at = ?2, error_message = ?3, failure_transient = ?4,
                         instance_id = NULL, external_task_id = NULL, started_at = NULL,
                         updated_at = ?5
                     WHERE id = ?1",
                    params![sub_id.to_string(), ts(at), error, transient, ts(now)],
                )?;
                SubTaskStatus::Paused
            }
            (None, _) => {
                tx.execute(
                    "UPDATE sub_tasks
                     SET status = 'failed', paused_from = NULL, next_attempt_at = NULL,
                         error_message = ?2, failure_transient = ?3, completed_at = ?4,
                         updated_at = ?4
                     WHERE id = ?1",
                    params![sub_id.to_string(), error, transient, ts(now)],
                )?;
                rollup(&tx, sub.master_task_id, now)?;
                SubTaskStatus::Failed
            }
        };
        tx.commit()?;
        Ok(status)
    }

    /// `submitted -> analyzing`. Returns `false` when the row moved on.
    pub fn mark_analyzing(&self, sub_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sub_tasks SET status = 'analyzing', updated_at = ?2
             WHERE id = ?1 AND status = 'submitted'",
            params![sub_id.to_string(), ts(now)],
        )?;
        Ok(changed > 0)
    }

    /// Persist the result and move the sub-task to `completed`; rolls the
    /// batch up in the same transaction.
    pub fn complete_sub_task(
        &self,
        result: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> Result<Option<MasterTaskStatus>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let sub = load_sub_task(&tx, result.sub_task_id)?;
        if sub.status == SubTaskStatus::Paused {
            tracing::debug!(
                sub_task_id = %sub.id,
                "result arrived after pause; will be fetched again on resume"
            );
            return Ok(None);
        }
        if !sub.status.can_transition_to(SubTaskStatus::Completed) {
            return Err(invalid_transition(
                "sub-task",
                sub.id,
                sub.status,
                SubTaskStatus::Completed,
            ));
        }

        let summary = result.summary.to_string();
        let report = result.report.to_string();
        let insert = match result.analyzer_type {
            AnalyzerType::Cape => tx.execute(
                "INSERT INTO cape_analysis_results
                 (sub_task_id, external_task_id, malscore, summary, report, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sub.id.to_string(),
                    result.external_task_id,
                    result.summary.get("malscore").and_then(|v| v.as_f64()),
                    summary,
                    report,
                    ts(result.created_at),
                ],
            ),
            AnalyzerType::Cfg => tx.execute(
                "INSERT INTO cfg_analysis_results
                 (sub_task_id, external_task_id, summary, report, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    sub.id.to_string(),
                    result.external_task_id,
                    summary,
                    report,
                    ts(result.created_at),
                ],
            ),
        };
        insert.map_err(|e| StoreError::from_write(e, || format!("result for sub-task {}", sub.id)))?;

        tx.execute(
            "UPDATE sub_tasks
             SET status = 'completed', error_message = NULL, next_attempt_at = NULL,
                 completed_at = ?2, updated_at = ?2
             WHERE id = ?1",
            params![sub.id.to_string(), ts(now)],
        )?;
        let finalized = rollup(&tx, sub.master_task_id, now)?;
        tx.commit()?;
        Ok(finalized)
    }

    /// Recompute a batch's counters and finalize it when every sub-task is
    /// terminal.
    pub fn refresh_rollup(
        &self,
        master_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<MasterTaskStatus>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let finalized = rollup(&tx, master_id, now)?;
        tx.commit()?;
        Ok(finalized)
    }

    /// Per-state counts, computed from the sub-task table.
    pub fn status_counts(&self, master_id: Uuid) -> Result<StatusCounts, StoreError> {
        let conn = self.lock()?;
        load_master(&conn, master_id)?;
        counts_for(&conn, master_id)
    }

    /// Aggregated progress of a batch.
    pub fn runtime_status(&self, master_id: Uuid) -> Result<RuntimeStatus, StoreError> {
        let conn = self.lock()?;
        let master = load_master(&conn, master_id)?;
        let counts = counts_for(&conn, master_id)?;
        Ok(RuntimeStatus {
            master_task_id: master.id,
            status: master.status,
            total_samples: counts.total(),
            progress_percentage: counts.progress_percentage(),
            counts,
            created_at: master.created_at,
            updated_at: master.updated_at,
            paused_at: master.paused_at,
            pause_reason: master.pause_reason,
        })
    }

    /// Pause a `pending` or `running` batch and every non-terminal sub-task.
    /// Returns the number of sub-tasks paused.
    pub fn pause_master(
        &self,
        master_id: Uuid,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let master = load_master(&tx, master_id)?;
        set_master_status(&tx, &master, MasterTaskStatus::Paused, now)?;
        tx.execute(
            "UPDATE master_tasks SET paused_at = ?2, pause_reason = ?3 WHERE id = ?1",
            params![master_id.to_string(), ts(now), reason],
        )?;
        let paused = tx.execute(
            "UPDATE sub_tasks
             SET paused_from = status, status = 'paused', updated_at = ?2
             WHERE master_task_id = ?1
               AND status IN ('pending', 'submitting', 'submitted', 'analyzing')",
            params![master_id.to_string(), ts(now)],
        )?;
        tx.commit()?;
        Ok(paused as u32)
    }

    /// Resume a paused batch, restoring each paused sub-task to the state it
    /// was paused from. Returns the number of sub-tasks restored.
    ///
    /// `started_at` of remote work moves forward by the paused span, so the
    /// max-wait clock only counts time the batch was running.
    pub fn resume_master(&self, master_id: Uuid, now: DateTime<Utc>) -> Result<u32, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let master = load_master(&tx, master_id)?;
        if master.status != MasterTaskStatus::Paused {
            return Err(invalid_transition(
                "master task",
                master_id,
                master.status,
                MasterTaskStatus::Running,
            ));
        }
        set_master_status(&tx, &master, MasterTaskStatus::Running, now)?;
        tx.execute(
            "UPDATE master_tasks SET paused_at = NULL, pause_reason = NULL WHERE id = ?1",
            params![master_id.to_string()],
        )?;
        if let Some(paused_at) = master.paused_at {
            shift_started_at(&tx, master_id, now - paused_at, now)?;
        }
        let resumed = tx.execute(
            "UPDATE sub_tasks
             SET status = COALESCE(paused_from, 'pending'), paused_from = NULL, updated_at = ?2
             WHERE master_task_id = ?1 AND status = 'paused'",
            params![master_id.to_string(), ts(now)],
        )?;
        // Everything may have finished while paused.
        rollup(&tx, master_id, now)?;
        tx.commit()?;
        Ok(resumed as u32)
    }

    /// Cancel a batch and every non-terminal sub-task. Returns the number of
    /// sub-tasks cancelled.
    pub fn cancel_master(&self, master_id: Uuid, now: DateTime<Utc>) -> Result<u32, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let master = load_master(&tx, master_id)?;
        set_master_status(&tx, &master, MasterTaskStatus::Cancelled, now)?;
        let cancelled = tx.execute(
            "UPDATE sub_tasks
             SET status = 'cancelled', paused_from = NULL, next_attempt_at = NULL,
                 completed_at = ?2, updated_at = ?2
             WHERE master_task_id = ?1
               AND status IN ('pending', 'submitting', 'submitted', 'analyzing', 'paused')",
            params![master_id.to_string(), ts(now)],
        )?;
        rollup(&tx, master_id, now)?;
        tx.commit()?;
        Ok(cancelled as u32)
    }

    /// Delete a terminal batch with its sub-tasks and results.
    pub fn delete_master(&self, master_id: Uuid) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let master = load_master(&conn, master_id)?;
        if !master.status.is_terminal() {
            return Err(StoreError::InUse(format!(
                "master task {master_id} is {}; only terminal tasks can be deleted",
                master.status
            )));
        }
        conn.execute(
            "DELETE FROM master_tasks WHERE id = ?1",
            params![master_id.to_string()],
        )?;
        Ok(())
    }

    /// Fetch one sub-task.
    pub fn sub_task(&self, id: Uuid) -> Result<SubTask, StoreError> {
        let conn = self.lock()?;
        load_sub_task(&conn, id)
    }

    /// Paginated sub-tasks of a batch in dispatch order.
    pub fn list_sub_tasks(
        &self,
        master_id: Uuid,
        query: &SubTaskQuery,
    ) -> Result<Page<SubTask>, StoreError> {
        let conn = self.lock()?;
        load_master(&conn, master_id)?;
        let (page, page_size, offset) = page_bounds(query.page, query.page_size);
        let status = query.status.map(|s| s.as_str());
        let keyword = query
            .keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| format!("%{}%", k.replace('%', "\\%").replace('_', "\\_")));

        let filter = "master_task_id = ?1
             AND (?2 IS NULL OR status = ?2)
             AND (?3 IS NULL
                  OR sample_id LIKE ?3 ESCAPE '\\'
                  OR external_task_id LIKE ?3 ESCAPE '\\'
                  OR error_message LIKE ?3 ESCAPE '\\')";

        let total: i64 = conn.query_row(
            &format!("SELECT count(*) FROM sub_tasks WHERE {filter}"),
            params![master_id.to_string(), status, keyword],
            |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUB_COLUMNS} FROM sub_tasks WHERE {filter}
             ORDER BY priority DESC, created_at ASC, rowid ASC
             LIMIT ?4 OFFSET ?5"
        ))?;
        let items = stmt
            .query_map(
                params![master_id.to_string(), status, keyword, page_size, offset],
                sub_task_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page,
            page_size,
        })
    }

    /// One page of outstanding remote work (`submitted`/`analyzing`) of
    /// running batches, in insertion order after the cursor `after`.
    pub fn list_outstanding(
        &self,
        after: Option<i64>,
        limit: u32,
    ) -> Result<OutstandingPage, StoreError> {
        let conn = self.lock()?;
        let limit = limit.max(1);
        let columns = SUB_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT s.rowid AS cursor_rowid, {columns} FROM sub_tasks s
             JOIN master_tasks m ON m.id = s.master_task_id
             WHERE m.status = 'running' AND s.status IN ('submitted', 'analyzing')
               AND s.rowid > ?1
             ORDER BY s.rowid ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![after.unwrap_or(0), limit], |row| {
                Ok((row.get::<_, i64>("cursor_rowid")?, sub_task_from_row(row)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let next = match rows.last() {
            Some((rowid, _)) if rows.len() == limit as usize => Some(*rowid),
            _ => None,
        };
        Ok(OutstandingPage {
            items: rows.into_iter().map(|(_, sub)| sub).collect(),
            next,
        })
    }

    /// Sub-tasks stuck in `submitting` since before `cutoff`.
    pub fn list_stuck_submitting(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SubTask>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUB_COLUMNS} FROM sub_tasks
             WHERE status = 'submitting' AND updated_at < ?1
             ORDER BY updated_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![ts(cutoff), limit], sub_task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Reset one stuck sub-task to `pending`, keeping its retry count.
    /// Returns `false` if it was no longer stuck.
    pub fn reset_stuck_submitting(
        &self,
        sub_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.reset_stuck_submitting_unless(sub_id, cutoff, now, |_| false)
    }

    /// [`Self::reset_stuck_submitting`], leaving the row alone when `live`
    /// says a submission for it is still in progress. `live` runs under the
    /// store lock.
    pub fn reset_stuck_submitting_unless(
        &self,
        sub_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        live: impl FnOnce(Uuid) -> bool,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        if live(sub_id) {
            return Ok(false);
        }
        let changed = conn.execute(
            "UPDATE sub_tasks
             SET status = 'pending', instance_id = NULL, next_attempt_at = NULL,
                 error_message = 'recovered from interrupted submission', updated_at = ?3
             WHERE id = ?1 AND status = 'submitting' AND updated_at < ?2",
            params![sub_id.to_string(), ts(cutoff), ts(now)],
        )?;
        Ok(changed > 0)
    }

    /// Running batches whose sub-tasks are all terminal.
    pub fn list_unfinalized_masters(&self) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT m.id FROM master_tasks m
             WHERE m.status = 'running'
               AND EXISTS (SELECT 1 FROM sub_tasks s WHERE s.master_task_id = m.id)
               AND NOT EXISTS (
                   SELECT 1 FROM sub_tasks s
                   WHERE s.master_task_id = m.id
                     AND s.status NOT IN ('completed', 'failed', 'cancelled'))",
        )?;
        let rows = stmt
            .query_map([], |row| super::col_uuid(row, "id"))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Transiently failed sub-tasks whose batch is not paused or cancelled.
    pub fn list_sweep_candidates(&self, limit: u32) -> Result<Vec<SweepCandidate>, StoreError> {
        let conn = self.lock()?;
        let columns = SUB_COLUMNS
            .split(", ")
            .map(|c| format!("s.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns}, m.execution AS master_execution FROM sub_tasks s
             JOIN master_tasks m ON m.id = s.master_task_id
             WHERE s.status = 'failed' AND s.failure_transient = 1
               AND m.status IN ('running', 'completed', 'failed')
             ORDER BY s.completed_at ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], |row| {
            let sub_task = sub_task_from_row(row)?;
            let policy = col_json_opt(row, "master_execution")?
                .and_then(|v| serde_json::from_value::<ExecutionConfig>(v).ok())
                .map(|e| e.failed_retry)
                .unwrap_or_default();
            Ok(SweepCandidate { sub_task, policy })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Re-arm a failed sub-task for the sweep: `failed -> pending` with a
    /// fresh in-line retry budget, reopening a finalized batch.
    pub fn rearm_failed(&self, sub_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let sub = load_sub_task(&tx, sub_id)?;
        if sub.status != SubTaskStatus::Failed {
            return Ok(false);
        }
        let master = load_master(&tx, sub.master_task_id)?;
        match master.status {
            MasterTaskStatus::Running => {}
            MasterTaskStatus::Completed | MasterTaskStatus::Failed => {
                set_master_status(&tx, &master, MasterTaskStatus::Running, now)?;
                tx.execute(
                    "UPDATE master_tasks SET result_summary = NULL WHERE id = ?1",
                    params![master.id.to_string()],
                )?;
            }
            _ => return Ok(false),
        }

        tx.execute(
            "UPDATE sub_tasks
             SET status = 'pending', retry_count = 0, sweep_count = sweep_count + 1,
                 instance_id = NULL, external_task_id = NULL, next_attempt_at = NULL,
                 started_at = NULL, completed_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![sub_id.to_string(), ts(now)],
        )?;
        rollup(&tx, master.id, now)?;
        tx.commit()?;
        Ok(true)
    }

    /// Stored result of a completed sub-task.
    pub fn analysis_result(&self, sub_id: Uuid) -> Result<Option<AnalysisResult>, StoreError> {
        let conn = self.lock()?;
        let sub = load_sub_task(&conn, sub_id)?;
        let table = match sub.analyzer_type {
            AnalyzerType::Cape => "cape_analysis_results",
            AnalyzerType::Cfg => "cfg_analysis_results",
        };
        let row = conn
            .query_row(
                &format!(
                    "SELECT external_task_id, summary, report, created_at FROM {table}
                     WHERE sub_task_id = ?1"
                ),
                params![sub_id.to_string()],
                |row| {
                    Ok(AnalysisResult {
                        sub_task_id: sub.id,
                        analyzer_type: sub.analyzer_type,
                        external_task_id: row.get("external_task_id")?,
                        summary: col_json_opt(row, "summary")?.unwrap_or_default(),
                        report: col_json_opt(row, "report")?.unwrap_or_default(),
                        created_at: col_ts(row, "created_at")?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn shift_started_at(
    tx: &Transaction<'_>,
    master_id: Uuid,
    span: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if span <= chrono::Duration::zero() {
        return Ok(());
    }
    let started: Vec<(String, DateTime<Utc>)> = {
        let mut stmt = tx.prepare_cached(
            "SELECT id, started_at FROM sub_tasks
             WHERE master_task_id = ?1 AND status = 'paused' AND started_at IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![master_id.to_string()], |row| {
            Ok((row.get::<_, String>("id")?, col_ts(row, "started_at")?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    let mut update =
        tx.prepare_cached("UPDATE sub_tasks SET started_at = ?2 WHERE id = ?1")?;
    for (id, started_at) in started {
        // Submitted during the pause: the clock starts at resume at the latest.
        let shifted = started_at
            .checked_add_signed(span)
            .map_or(now, |t| t.min(now));
        update.execute(params![id, ts(shifted)])?;
    }
    Ok(())
}

fn insert_sub_tasks(
    tx: &Transaction<'_>,
    master_id: Uuid,
    analyzer: AnalyzerType,
    sample_ids: &[String],
    priority: i32,
    paused: bool,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let (status, paused_from) = if paused {
        (SubTaskStatus::Paused.as_str(), Some(SubTaskStatus::Pending.as_str()))
    } else {
        (SubTaskStatus::Pending.as_str(), None)
    };
    let mut stmt = tx.prepare_cached(
        "INSERT INTO sub_tasks
         (id, master_task_id, sample_id, analyzer_type, status, paused_from, priority,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
    )?;
    for sample_id in sample_ids {
        stmt.execute(params![
            Uuid::new_v4().to_string(),
            master_id.to_string(),
            sample_id,
            analyzer.as_str(),
            status,
            paused_from,
            priority,
            ts(now),
        ])
        .map_err(|e| {
            StoreError::from_write(e, || {
                format!("sample {sample_id} is already part of master task {master_id}")
            })
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    fn new_task(samples: &[&str]) -> NewMasterTask {
        NewMasterTask {
            name: "batch".to_string(),
            analyzer_type: AnalyzerType::Cape,
            task_type: TaskKind::Batch,
            sample_ids: samples.iter().map(|s| s.to_string()).collect(),
            instance_ids: Vec::new(),
            parameters: None,
            sample_filter: None,
            priority: 0,
        }
    }

    fn running(store: &TaskStore, samples: &[&str]) -> MasterTask {
        let now = Utc::now();
        let master = store.create_master_task(&new_task(samples), now).unwrap();
        store
            .start_master(master.id, &ExecutionConfig::default(), now)
            .unwrap()
    }

    fn subs(store: &TaskStore, master_id: Uuid) -> Vec<SubTask> {
        store
            .list_sub_tasks(master_id, &SubTaskQuery::default())
            .unwrap()
            .items
    }

    fn result_for(sub: &SubTask) -> AnalysisResult {
        AnalysisResult {
            sub_task_id: sub.id,
            analyzer_type: sub.analyzer_type,
            external_task_id: sub.external_task_id.clone().unwrap_or_default(),
            summary: serde_json::json!({"malscore": 4.5}),
            report: serde_json::json!({"info": {}}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn create_then_duplicate_sample_is_rejected() {
        let store = store();
        let master = store
            .create_master_task(&new_task(&["a", "b"]), Utc::now())
            .unwrap();
        assert_eq!(master.total_samples, 2);
        assert_eq!(master.status, MasterTaskStatus::Pending);

        let err = store
            .add_samples(master.id, &["c".to_string(), "a".to_string()], 0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)), "{err:?}");
        // The whole call rolled back.
        assert_eq!(subs(&store, master.id).len(), 2);

        assert_eq!(
            store
                .add_samples(master.id, &["c".to_string()], 0, Utc::now())
                .unwrap(),
            1
        );
        assert_eq!(store.master_task(master.id).unwrap().total_samples, 3);
    }

    #[test]
    fn duplicate_sample_within_create_is_rejected() {
        let store = store();
        let err = store
            .create_master_task(&new_task(&["a", "a"]), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(
            store
                .list_master_tasks(&MasterQuery::default())
                .unwrap()
                .total,
            0
        );
    }

    #[test]
    fn claim_orders_by_priority_then_creation() {
        let store = store();
        let master = running(&store, &["low-1", "low-2"]);
        store
            .add_samples(master.id, &["high".to_string()], 5, Utc::now())
            .unwrap();
        let inst = Uuid::new_v4();

        let order: Vec<String> = std::iter::from_fn(|| {
            store
                .claim_next_pending(master.id, inst, Utc::now())
                .unwrap()
                .map(|s| s.sample_id)
        })
        .collect();
        assert_eq!(order, vec!["high", "low-1", "low-2"]);
    }

    #[test]
    fn claim_skips_pending_master_and_future_gate() {
        let store = store();
        let now = Utc::now().trunc_subsecs(6);
        let master = store.create_master_task(&new_task(&["a"]), now).unwrap();
        assert!(
            store
                .claim_next_pending(master.id, Uuid::new_v4(), now)
                .unwrap()
                .is_none()
        );

        store
            .start_master(master.id, &ExecutionConfig::default(), now)
            .unwrap();
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), now)
            .unwrap()
            .unwrap();
        let gate = now + Duration::seconds(5);
        assert_eq!(
            store
                .record_failure(sub.id, "timeout", true, Some(gate), now)
                .unwrap(),
            SubTaskStatus::Pending
        );
        assert!(
            store
                .claim_next_pending(master.id, Uuid::new_v4(), now)
                .unwrap()
                .is_none()
        );
        assert_eq!(store.next_retry_gate(master.id).unwrap(), Some(gate));

        let again = store
            .claim_next_pending(master.id, Uuid::new_v4(), gate)
            .unwrap()
            .unwrap();
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.error_message.as_deref(), Some("timeout"));
    }

    #[test]
    fn second_submission_is_an_invariant_violation() {
        let store = store();
        let master = running(&store, &["a"]);
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), Utc::now())
            .unwrap()
            .unwrap();
        store.record_submitted(sub.id, "17", Utc::now()).unwrap();
        let err = store.record_submitted(sub.id, "18", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(
            store.sub_task(sub.id).unwrap().external_task_id.as_deref(),
            Some("17")
        );
    }

    #[test]
    fn completed_cannot_go_back_to_submitting() {
        let store = store();
        let master = running(&store, &["a", "b"]);
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), Utc::now())
            .unwrap()
            .unwrap();
        store.record_submitted(sub.id, "1", Utc::now()).unwrap();
        let sub = store.sub_task(sub.id).unwrap();
        store.complete_sub_task(&result_for(&sub), Utc::now()).unwrap();

        let err = store.record_failure(sub.id, "boom", false, None, Utc::now());
        assert!(matches!(err, Err(StoreError::InvalidTransition { .. })));
        let err = store.complete_sub_task(&result_for(&sub), Utc::now());
        assert!(matches!(err, Err(StoreError::InvalidTransition { .. })));
    }

    #[test]
    fn batch_finalizes_once_all_terminal() {
        let store = store();
        let master = running(&store, &["a", "b"]);
        let inst = Uuid::new_v4();

        let a = store.claim_next_pending(master.id, inst, Utc::now()).unwrap().unwrap();
        store.record_submitted(a.id, "1", Utc::now()).unwrap();
        assert!(store.mark_analyzing(a.id, Utc::now()).unwrap());
        let a = store.sub_task(a.id).unwrap();
        assert_eq!(store.complete_sub_task(&result_for(&a), Utc::now()).unwrap(), None);

        let b = store.claim_next_pending(master.id, inst, Utc::now()).unwrap().unwrap();
        assert_eq!(
            store
                .record_failure(b.id, "not a PE file", false, None, Utc::now())
                .unwrap(),
            SubTaskStatus::Failed
        );

        let master = store.master_task(master.id).unwrap();
        assert_eq!(master.status, MasterTaskStatus::Completed);
        assert_eq!(master.completed_samples, 1);
        assert_eq!(master.failed_samples, 1);
        assert_eq!(master.progress, 100.0);
        assert!(master.result_summary.is_some());

        let stored = store.analysis_result(a.id).unwrap().unwrap();
        assert_eq!(stored.summary["malscore"], 4.5);
    }

    #[test]
    fn all_failures_fail_the_batch() {
        let store = store();
        let master = running(&store, &["a"]);
        let a = store
            .claim_next_pending(master.id, Uuid::new_v4(), Utc::now())
            .unwrap()
            .unwrap();
        store.record_failure(a.id, "bad", false, None, Utc::now()).unwrap();
        assert_eq!(
            store.master_task(master.id).unwrap().status,
            MasterTaskStatus::Failed
        );
    }

    #[test]
    fn pause_and_resume_restore_prior_states() {
        let store = store();
        let master = running(&store, &["a", "b", "c"]);
        let inst = Uuid::new_v4();
        for ext in ["1", "2"] {
            let sub = store.claim_next_pending(master.id, inst, Utc::now()).unwrap().unwrap();
            store.record_submitted(sub.id, ext, Utc::now()).unwrap();
        }
        let before = subs(&store, master.id);

        assert_eq!(store.pause_master(master.id, Some("maintenance"), Utc::now()).unwrap(), 3);
        let counts = store.status_counts(master.id).unwrap();
        assert_eq!(counts.paused, 3);
        assert_eq!(counts.total(), 3);
        let m = store.master_task(master.id).unwrap();
        assert_eq!(m.status, MasterTaskStatus::Paused);
        assert_eq!(m.pause_reason.as_deref(), Some("maintenance"));
        assert!(store.list_outstanding(None, 100).unwrap().items.is_empty());
        assert!(
            store
                .claim_next_pending(master.id, inst, Utc::now())
                .unwrap()
                .is_none()
        );

        assert_eq!(store.resume_master(master.id, Utc::now()).unwrap(), 3);
        let after = subs(&store, master.id);
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.status, a.status);
            assert_eq!(b.retry_count, a.retry_count);
            assert_eq!(b.external_task_id, a.external_task_id);
            assert_eq!(a.paused_from, None);
        }
        let counts = store.status_counts(master.id).unwrap();
        assert_eq!((counts.submitted, counts.pending), (2, 1));
        assert!(store.master_task(master.id).unwrap().paused_at.is_none());
    }

    #[test]
    fn pause_requires_pending_or_running_and_resume_requires_paused() {
        let store = store();
        let master = running(&store, &["a"]);
        assert!(matches!(
            store.resume_master(master.id, Utc::now()),
            Err(StoreError::InvalidTransition { .. })
        ));
        store.cancel_master(master.id, Utc::now()).unwrap();
        assert!(matches!(
            store.pause_master(master.id, None, Utc::now()),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn submission_landing_while_paused_resumes_as_submitted() {
        let store = store();
        let master = running(&store, &["a"]);
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), Utc::now())
            .unwrap()
            .unwrap();
        store.pause_master(master.id, None, Utc::now()).unwrap();
        assert_eq!(
            store.record_submitted(sub.id, "77", Utc::now()).unwrap(),
            SubTaskStatus::Paused
        );
        store.resume_master(master.id, Utc::now()).unwrap();
        let sub = store.sub_task(sub.id).unwrap();
        assert_eq!(sub.status, SubTaskStatus::Submitted);
        assert_eq!(sub.external_task_id.as_deref(), Some("77"));
    }

    #[test]
    fn samples_added_to_paused_batch_wait_paused() {
        let store = store();
        let master = running(&store, &["a"]);
        store.pause_master(master.id, None, Utc::now()).unwrap();
        assert_eq!(
            store.add_samples(master.id, &["b".to_string()], 0, Utc::now()).unwrap(),
            1
        );
        let added = subs(&store, master.id)
            .into_iter()
            .find(|s| s.sample_id == "b")
            .unwrap();
        assert_eq!(added.status, SubTaskStatus::Paused);
        assert_eq!(added.paused_from, Some(SubTaskStatus::Pending));
        assert!(
            store
                .claim_next_pending(master.id, Uuid::new_v4(), Utc::now())
                .unwrap()
                .is_none()
        );

        assert_eq!(store.resume_master(master.id, Utc::now()).unwrap(), 2);
        assert_eq!(store.status_counts(master.id).unwrap().pending, 2);
    }

    #[test]
    fn resume_moves_started_at_past_the_pause() {
        let store = store();
        let master = running(&store, &["a"]);
        let now = Utc::now().trunc_subsecs(6);
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), now - Duration::minutes(10))
            .unwrap()
            .unwrap();
        store
            .record_submitted(sub.id, "1", now - Duration::minutes(10))
            .unwrap();
        store
            .pause_master(master.id, None, now - Duration::minutes(8))
            .unwrap();
        store.resume_master(master.id, now).unwrap();

        let sub = store.sub_task(sub.id).unwrap();
        assert_eq!(sub.status, SubTaskStatus::Submitted);
        assert_eq!(sub.started_at, Some(now - Duration::minutes(2)));
    }

    #[test]
    fn outstanding_pages_cover_every_row_once() {
        let store = store();
        let samples: Vec<String> = (0..7).map(|i| format!("s{i}")).collect();
        let refs: Vec<&str> = samples.iter().map(String::as_str).collect();
        let master = running(&store, &refs);
        let inst = Uuid::new_v4();
        for i in 0..7 {
            let sub = store.claim_next_pending(master.id, inst, Utc::now()).unwrap().unwrap();
            store.record_submitted(sub.id, &i.to_string(), Utc::now()).unwrap();
        }

        let mut seen = Vec::new();
        let mut after = None;
        let mut pages = 0;
        loop {
            let page = store.list_outstanding(after, 3).unwrap();
            pages += 1;
            seen.extend(page.items.into_iter().map(|s| s.id));
            match page.next {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }
        assert_eq!(pages, 3);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn cancel_counts_toward_failed_and_finalizes() {
        let store = store();
        let master = running(&store, &["a", "b"]);
        assert_eq!(store.cancel_master(master.id, Utc::now()).unwrap(), 2);
        let m = store.master_task(master.id).unwrap();
        assert_eq!(m.status, MasterTaskStatus::Cancelled);
        assert_eq!(m.failed_samples, 2);
        let counts = store.status_counts(master.id).unwrap();
        assert_eq!(counts.cancelled, 2);

        store.delete_master(master.id).unwrap();
        assert!(matches!(
            store.master_task(master.id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn running_batch_cannot_be_deleted() {
        let store = store();
        let master = running(&store, &["a"]);
        assert!(matches!(store.delete_master(master.id), Err(StoreError::InUse(_))));
    }

    #[test]
    fn stuck_submitting_reset_keeps_retry_count() {
        let store = store();
        let master = running(&store, &["a"]);
        let t0 = Utc::now() - Duration::minutes(30);
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), t0)
            .unwrap()
            .unwrap();
        store
            .record_failure(sub.id, "timeout", true, Some(t0), t0)
            .unwrap();
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), t0)
            .unwrap()
            .unwrap();
        assert_eq!(sub.retry_count, 1);

        let cutoff = Utc::now() - Duration::minutes(5);
        let stuck = store.list_stuck_submitting(cutoff, 10).unwrap();
        assert_eq!(stuck.len(), 1);
        assert!(store.reset_stuck_submitting(sub.id, cutoff, Utc::now()).unwrap());
        assert!(!store.reset_stuck_submitting(sub.id, cutoff, Utc::now()).unwrap());

        let sub = store.sub_task(sub.id).unwrap();
        assert_eq!(sub.status, SubTaskStatus::Pending);
        assert_eq!(sub.retry_count, 1);
        assert_eq!(sub.instance_id, None);
    }

    #[test]
    fn rearm_reopens_finalized_batch_with_fresh_budget() {
        let store = store();
        let master = running(&store, &["a"]);
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), Utc::now())
            .unwrap()
            .unwrap();
        store
            .record_failure(sub.id, "connection refused", true, None, Utc::now())
            .unwrap();
        assert_eq!(
            store.master_task(master.id).unwrap().status,
            MasterTaskStatus::Failed
        );

        let candidates = store.list_sweep_candidates(10).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].policy, FailedTaskRetryPolicy::default());

        assert!(store.rearm_failed(sub.id, Utc::now()).unwrap());
        let sub = store.sub_task(sub.id).unwrap();
        assert_eq!(sub.status, SubTaskStatus::Pending);
        assert_eq!((sub.retry_count, sub.sweep_count), (0, 1));
        let m = store.master_task(master.id).unwrap();
        assert_eq!(m.status, MasterTaskStatus::Running);
        assert_eq!(m.failed_samples, 0);
        assert!(!store.rearm_failed(sub.id, Utc::now()).unwrap());
    }

    #[test]
    fn permanent_failures_are_not_sweep_candidates() {
        let store = store();
        let master = running(&store, &["a"]);
        let sub = store
            .claim_next_pending(master.id, Uuid::new_v4(), Utc::now())
            .unwrap()
            .unwrap();
        store
            .record_failure(sub.id, "unsupported file", false, None, Utc::now())
            .unwrap();
        assert!(store.list_sweep_candidates(10).unwrap().is_empty());
    }

    #[test]
    fn unfinalized_running_batch_is_listed_and_rolled_up() {
        let store = store();
        let master = running(&store, &["a"]);
        // Simulate a crash between sub-task completion and master rollup.
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "UPDATE sub_tasks SET status = 'completed' WHERE master_task_id = ?1",
                params![master.id.to_string()],
            )
            .unwrap();
        }
        assert_eq!(store.list_unfinalized_masters().unwrap(), vec![master.id]);
        assert_eq!(
            store.refresh_rollup(master.id, Utc::now()).unwrap(),
            Some(MasterTaskStatus::Completed)
        );
        assert!(store.list_unfinalized_masters().unwrap().is_empty());
    }

    #[test]
    fn sub_task_listing_filters_and_paginates() {
        let store = store();
        let master = running(&store, &["alpha", "beta", "gamma", "alphabet"]);
        let page = store
            .list_sub_tasks(
                master.id,
                &SubTaskQuery {
                    keyword: Some("alpha".to_string()),
                    page: 1,
                    page_size: 1,
                    ..SubTaskQuery::default()
                },
            )
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].sample_id, "alpha");

        let none = store
            .list_sub_tasks(
                master.id,
                &SubTaskQuery {
                    status: Some(SubTaskStatus::Completed),
                    ..SubTaskQuery::default()
                },
            )
            .unwrap();
        assert_eq!(none.total, 0);
    }

    #[test]
    fn counts_always_sum_to_total() {
        let store = store();
        let master = running(&store, &["a", "b", "c", "d", "e"]);
        let inst = Uuid::new_v4();
        let check = |store: &TaskStore| {
            let m = store.master_task(master.id).unwrap();
            assert_eq!(store.status_counts(master.id).unwrap().total(), m.total_samples);
        };
        check(&store);
        let a = store.claim_next_pending(master.id, inst, Utc::now()).unwrap().unwrap();
        check(&store);
        store.record_submitted(a.id, "1", Utc::now()).unwrap();
        let b = store.claim_next_pending(master.id, inst, Utc::now()).unwrap().unwrap();
        store.record_failure(b.id, "x", false, None, Utc::now()).unwrap();
        check(&store);
        store.pause_master(master.id, None, Utc::now()).unwrap();
        check(&store);
        store.resume_master(master.id, Utc::now()).unwrap();
        check(&store);
        store.cancel_master(master.id, Utc::now()).unwrap();
        check(&store);
    }
}
