use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use samplefarm_core::{ExecutionConfig, RetryDecision};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::api::EngineEvent;
use crate::backend::{BackendError, RemoteState};
use crate::engine::Shared;
use crate::model::{AnalysisResult, AnalyzerInstance, RuntimeStatusSnapshot, SubTask, SubTaskStatus};
use crate::retry::{Failure, FailureOutcome, handle_failure};
use crate::store::StoreError;

/// Outstanding sub-tasks read per store page.
const POLL_PAGE: u32 = 500;

struct Tracked {
    snapshot: RuntimeStatusSnapshot,
    next_poll_at: Instant,
}

/// Last known remote state of every outstanding sub-task, plus when it is
/// due for its next poll. Advisory only: rebuilt from polls, never consulted
/// for scheduling beyond poll pacing.
#[derive(Default)]
pub(crate) struct SnapshotCache {
    entries: Mutex<HashMap<Uuid, Tracked>>,
}

impl SnapshotCache {
    pub(crate) fn get(&self, sub_id: Uuid) -> Option<RuntimeStatusSnapshot> {
        let entries = self.entries.lock().ok()?;
        entries.get(&sub_id).map(|t| t.snapshot.clone())
    }

    /// Untracked sub-tasks are always due.
    pub(crate) fn due(&self, sub_id: Uuid, now: Instant) -> bool {
        match self.entries.lock() {
            Ok(entries) => entries.get(&sub_id).is_none_or(|t| t.next_poll_at <= now),
            Err(_) => true,
        }
    }

    pub(crate) fn record_ok(
        &self,
        sub_id: Uuid,
        raw_status: String,
        payload: serde_json::Value,
        next_poll_at: Instant,
    ) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                sub_id,
                Tracked {
                    snapshot: RuntimeStatusSnapshot {
                        sub_task_id: sub_id,
                        raw_status,
                        payload,
                        fetched_at: Utc::now(),
                        poll_failures: 0,
                        last_error: None,
                    },
                    next_poll_at,
                },
            );
        }
    }

    /// Count a failed poll and return the consecutive failure count.
    pub(crate) fn record_err(&self, sub_id: Uuid, error: String, next_poll_at: Instant) -> u32 {
        let Ok(mut entries) = self.entries.lock() else {
            return 1;
        };
        let tracked = entries.entry(sub_id).or_insert_with(|| Tracked {
            snapshot: RuntimeStatusSnapshot {
                sub_task_id: sub_id,
                raw_status: String::new(),
                payload: serde_json::Value::Null,
                fetched_at: Utc::now(),
                poll_failures: 0,
                last_error: None,
            },
            next_poll_at,
        });
        tracked.snapshot.poll_failures += 1;
        tracked.snapshot.last_error = Some(error);
        tracked.next_poll_at = next_poll_at;
        tracked.snapshot.poll_failures
    }

    pub(crate) fn defer(&self, sub_id: Uuid, until: Instant) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(t) = entries.get_mut(&sub_id) {
                t.next_poll_at = until;
            }
        }
    }

    pub(crate) fn remove(&self, sub_id: Uuid) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&sub_id);
        }
    }

    /// Drop entries for sub-tasks no longer outstanding.
    pub(crate) fn retain(&self, live: &HashSet<Uuid>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|id, _| live.contains(id));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

/// How one poll ended for a sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    StillRunning,
    Completed,
    Failed,
    Retrying,
    PollError,
    Skipped,
}

/// Poll every outstanding sub-task that is due. Returns the outcomes in no
/// particular order.
///
/// The whole outstanding set is walked page by page on every cycle, so no
/// sub-task waits behind older ones for its turn.
pub(crate) async fn poll_cycle(shared: &Arc<Shared>) -> Result<Vec<PollOutcome>, StoreError> {
    let instances: HashMap<Uuid, AnalyzerInstance> = shared
        .store
        .call(|s| s.list_instances(None))
        .await?
        .into_iter()
        .map(|i| (i.id, i))
        .collect();
    let mut executions: HashMap<Uuid, Option<Arc<ExecutionConfig>>> = HashMap::new();
    let mut live: HashSet<Uuid> = HashSet::new();
    let mut walked_all = false;

    let now = Instant::now();
    let mut polls = JoinSet::new();
    let mut after = None;
    'pages: loop {
        let page = shared
            .store
            .call(move |s| s.list_outstanding(after, POLL_PAGE))
            .await?;
        for sub in page.items {
            live.insert(sub.id);
            if shared.inner.should_stop() {
                break 'pages;
            }
            if !shared.snapshots.due(sub.id, now) {
                continue;
            }

            let master_id = sub.master_task_id;
            let execution = match executions.get(&master_id) {
                Some(cached) => cached.clone(),
                None => {
                    let loaded = match shared.store.call(move |s| s.master_task(master_id)).await {
                        Ok(master) => Some(Arc::new(shared.execution(&master))),
                        Err(err) => {
                            tracing::warn!(
                                master_task_id = %master_id,
                                error = %err,
                                "loading batch failed; its sub-tasks wait for the next cycle"
                            );
                            None
                        }
                    };
                    executions.insert(master_id, loaded.clone());
                    loaded
                }
            };
            let Some(execution) = execution else {
                continue;
            };

            let Some(instance) = sub.instance_id.and_then(|id| instances.get(&id)).cloned() else {
                // The instance was removed while work was outstanding.
                let failure = Failure::transient("analyzer instance no longer configured");
                polls.spawn(fail(shared.clone(), sub, execution, failure));
                continue;
            };

            let Ok(permit) = shared.permits.clone().acquire_owned().await else {
                break 'pages;
            };
            let shared = shared.clone();
            polls.spawn(async move {
                let outcome = poll_one(&shared, &sub, &instance, &execution).await;
                drop(permit);
                outcome
            });
        }
        match page.next {
            Some(cursor) => after = Some(cursor),
            None => {
                walked_all = true;
                break;
            }
        }
    }
    // A partial walk would evict entries it never reached.
    if walked_all {
        shared.snapshots.retain(&live);
    }

    let mut outcomes = Vec::new();
    while let Some(res) = polls.join_next().await {
        match res {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => shared.emit(EngineEvent::Error {
                message: format!("poll task join error: {err}"),
            }),
        }
    }
    Ok(outcomes)
}

async fn poll_one(
    shared: &Shared,
    sub: &SubTask,
    instance: &AnalyzerInstance,
    execution: &ExecutionConfig,
) -> PollOutcome {
    let Some(external_task_id) = sub.external_task_id.clone() else {
        tracing::error!(sub_task_id = %sub.id, "outstanding sub-task has no remote task id");
        return fail_inline(
            shared,
            sub,
            execution,
            Failure::transient("remote task id missing"),
        )
        .await;
    };

    if let (Some(max_wait), Some(started)) = (execution.max_wait(), sub.started_at) {
        let waited = (Utc::now() - started).to_std().unwrap_or(Duration::ZERO);
        if waited > max_wait {
            let failure = Failure::transient(format!(
                "remote analysis exceeded max wait of {}s",
                max_wait.as_secs()
            ));
            return fail_inline(shared, sub, execution, failure).await;
        }
    }

    let Some(client) = shared.backends.get(sub.analyzer_type) else {
        let failure = Failure::permanent(format!("no adapter registered for {}", sub.analyzer_type));
        return fail_inline(shared, sub, execution, failure).await;
    };

    let budget = instance.timeout() + Duration::from_secs(1);
    let polled = tokio::time::timeout(budget, client.poll(instance, &external_task_id))
        .await
        .unwrap_or(Err(BackendError::Timeout));

    let poll = match polled {
        Ok(poll) => poll,
        Err(err) => return poll_failed(shared, sub, execution, err).await,
    };
    let next = Instant::now() + execution.poll_interval();
    tracing::trace!(
        sub_task_id = %sub.id,
        external_task_id,
        raw_status = %poll.raw_status,
        "polled remote task"
    );

    match poll.state {
        RemoteState::Running => {
            let started = poll.raw_status != "pending";
            shared
                .snapshots
                .record_ok(sub.id, poll.raw_status, poll.payload, next);
            if started && sub.status == SubTaskStatus::Submitted {
                let sub_id = sub.id;
                if let Err(err) = shared
                    .store
                    .call(move |s| s.mark_analyzing(sub_id, Utc::now()))
                    .await
                {
                    tracing::warn!(sub_task_id = %sub.id, error = %err, "marking analyzing failed");
                }
            }
            PollOutcome::StillRunning
        }
        RemoteState::Failed { transient } => {
            shared.snapshots.remove(sub.id);
            let failure = Failure {
                message: format!("remote analysis failed: {}", poll.raw_status),
                transient,
            };
            fail_inline(shared, sub, execution, failure).await
        }
        RemoteState::Complete => {
            shared
                .snapshots
                .record_ok(sub.id, poll.raw_status, poll.payload, next);
            let fetched = tokio::time::timeout(
                budget,
                client.fetch_result(instance, &external_task_id),
            )
            .await
            .unwrap_or(Err(BackendError::Timeout));

            match fetched {
                Ok(result) => store_result(shared, sub, external_task_id, result).await,
                Err(BackendError::NotReady(reason)) => {
                    tracing::debug!(sub_task_id = %sub.id, reason, "result not ready yet");
                    PollOutcome::StillRunning
                }
                Err(err) => poll_failed(shared, sub, execution, err).await,
            }
        }
    }
}

async fn store_result(
    shared: &Shared,
    sub: &SubTask,
    external_task_id: String,
    result: crate::backend::ResultPayload,
) -> PollOutcome {
    let record = AnalysisResult {
        sub_task_id: sub.id,
        analyzer_type: sub.analyzer_type,
        external_task_id,
        summary: result.summary,
        report: result.report,
        created_at: Utc::now(),
    };
    match shared
        .store
        .call(move |s| s.complete_sub_task(&record, Utc::now()))
        .await
    {
        Ok(finalized) => {
            shared.snapshots.remove(sub.id);
            tracing::info!(
                sub_task_id = %sub.id,
                master_task_id = %sub.master_task_id,
                "analysis result stored"
            );
            shared.emit(EngineEvent::SubTaskCompleted {
                master_task_id: sub.master_task_id,
                sub_task_id: sub.id,
            });
            if let Some(status) = finalized {
                shared.finalized(sub.master_task_id, status);
            }
            PollOutcome::Completed
        }
        Err(err) => {
            tracing::warn!(sub_task_id = %sub.id, error = %err, "storing analysis result failed");
            shared.emit(EngineEvent::Warning {
                message: format!("sub-task {}: storing result: {err}", sub.id),
            });
            PollOutcome::Skipped
        }
    }
}

/// A failed poll call. Consecutive failures back off under the batch retry
/// policy; once the budget is spent the sub-task fails as transient, which
/// leaves it to the failed-task sweep.
async fn poll_failed(
    shared: &Shared,
    sub: &SubTask,
    execution: &ExecutionConfig,
    err: BackendError,
) -> PollOutcome {
    let message = err.to_string();
    let failures = shared.snapshots.record_err(
        sub.id,
        message.clone(),
        Instant::now() + execution.poll_interval(),
    );
    match execution.retry.decide(failures) {
        RetryDecision::RetryAfter(delay) => {
            let delay = delay.max(execution.poll_interval());
            shared.snapshots.defer(sub.id, Instant::now() + delay);
            tracing::warn!(
                sub_task_id = %sub.id,
                attempt = failures,
                retry_in_secs = delay.as_secs(),
                error = %message,
                "poll failed"
            );
            PollOutcome::PollError
        }
        RetryDecision::Exhausted => {
            shared.snapshots.remove(sub.id);
            let sub_id = sub.id;
            let error = format!("polling failed {failures} times: {message}");
            let recorded = error.clone();
            match shared
                .store
                .call(move |s| s.record_failure(sub_id, &recorded, true, None, Utc::now()))
                .await
            {
                Ok(SubTaskStatus::Failed) => {
                    tracing::warn!(sub_task_id = %sub.id, error, "sub-task failed: remote unreachable");
                    shared.emit(EngineEvent::SubTaskFailed {
                        master_task_id: sub.master_task_id,
                        sub_task_id: sub.id,
                        error,
                        will_retry: false,
                    });
                    shared.note_finalized(sub.master_task_id).await;
                    PollOutcome::Failed
                }
                Ok(_) => PollOutcome::Skipped,
                Err(err) => {
                    tracing::warn!(sub_task_id = %sub.id, error = %err, "recording poll failure failed");
                    PollOutcome::Skipped
                }
            }
        }
    }
}

/// Route a remote failure through the retry controller.
async fn fail_inline(
    shared: &Shared,
    sub: &SubTask,
    execution: &ExecutionConfig,
    failure: Failure,
) -> PollOutcome {
    shared.snapshots.remove(sub.id);
    let message = failure.message.clone();
    match handle_failure(&shared.store, sub, &execution.retry, failure).await {
        Ok(outcome) => {
            let will_retry = matches!(outcome, FailureOutcome::Retrying { .. });
            shared.emit(EngineEvent::SubTaskFailed {
                master_task_id: sub.master_task_id,
                sub_task_id: sub.id,
                error: message,
                will_retry,
            });
            match outcome {
                FailureOutcome::Retrying { .. } => PollOutcome::Retrying,
                FailureOutcome::Parked => PollOutcome::Skipped,
                FailureOutcome::Failed => {
                    shared.note_finalized(sub.master_task_id).await;
                    PollOutcome::Failed
                }
            }
        }
        Err(err) => {
            tracing::warn!(sub_task_id = %sub.id, error = %err, "recording remote failure failed");
            PollOutcome::Skipped
        }
    }
}

async fn fail(
    shared: Arc<Shared>,
    sub: SubTask,
    execution: Arc<ExecutionConfig>,
    failure: Failure,
) -> PollOutcome {
    fail_inline(&shared, &sub, &execution, failure).await
}

/// Poll outstanding work until the engine stops.
pub(crate) async fn run_poll_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.cfg.poll_tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shared.inner.stopped() => break,
        }
        if let Err(err) = poll_cycle(&shared).await {
            tracing::warn!(error = %err, "poll cycle failed");
            shared.emit(EngineEvent::Warning {
                message: format!("poll cycle failed: {err}"),
            });
        }
    }
    tracing::debug!("poller exited");
}

#[cfg(test)]
mod tests {
    use samplefarm_core::RetryPolicy;

    use super::*;
    use crate::backend::ResultPayload;
    use crate::model::{MasterTask, MasterTaskStatus};
    use crate::testing::{Harness, fast_execution, remote};

    /// A batch of `n` samples, every sub-task submitted at `submitted_at`.
    async fn submitted(h: &Harness, n: usize, submitted_at: chrono::DateTime<Utc>) -> MasterTask {
        let inst = h.instance("cape-1", 0).await;
        let ids = ["a", "b", "c", "d", "e"];
        let master = h.batch(&ids[..n]).await;
        for i in 0..n {
            let sub = h
                .store()
                .claim_next_pending(master.id, inst.id, Utc::now())
                .unwrap()
                .unwrap();
            h.store()
                .record_submitted(sub.id, &format!("ext-{i}"), submitted_at)
                .unwrap();
        }
        master
    }

    #[tokio::test]
    async fn running_updates_snapshot_and_marks_analyzing() {
        let h = Harness::new().await;
        let master = submitted(&h, 1, Utc::now()).await;
        h.cape.push_poll(Ok(remote(RemoteState::Running, "running")));

        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::StillRunning]);
        let sub = &h.sub_tasks(master.id)[0];
        assert_eq!(sub.status, SubTaskStatus::Analyzing);
        let snap = h.shared.snapshots.get(sub.id).unwrap();
        assert_eq!(snap.raw_status, "running");
        assert_eq!(snap.poll_failures, 0);

        // Not due again until the poll interval passes.
        assert!(poll_cycle(&h.shared).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn queued_task_stays_submitted() {
        let h = Harness::new().await;
        let master = submitted(&h, 1, Utc::now()).await;
        h.cape.push_poll(Ok(remote(RemoteState::Running, "pending")));
        poll_cycle(&h.shared).await.unwrap();
        assert_eq!(h.sub_tasks(master.id)[0].status, SubTaskStatus::Submitted);
    }

    #[tokio::test]
    async fn completion_stores_result_and_finalizes() {
        let h = Harness::new().await;
        let master = submitted(&h, 1, Utc::now()).await;
        h.cape.push_poll(Ok(remote(RemoteState::Complete, "reported")));
        h.cape.push_fetch(Ok(ResultPayload {
            summary: serde_json::json!({ "malscore": 7.0 }),
            report: serde_json::json!({ "signatures": [] }),
        }));

        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::Completed]);
        let sub = &h.sub_tasks(master.id)[0];
        assert_eq!(sub.status, SubTaskStatus::Completed);
        let result = h.store().analysis_result(sub.id).unwrap().unwrap();
        assert_eq!(result.external_task_id, "ext-0");
        assert_eq!(result.summary["malscore"], 7.0);
        assert_eq!(
            h.store().master_task(master.id).unwrap().status,
            MasterTaskStatus::Completed
        );
        assert_eq!(h.shared.snapshots.len(), 0);
    }

    #[tokio::test]
    async fn report_not_ready_keeps_polling() {
        let h = Harness::new().await;
        let master = submitted(&h, 1, Utc::now()).await;
        h.cape.push_poll(Ok(remote(RemoteState::Complete, "completed")));
        h.cape
            .push_fetch(Err(BackendError::NotReady("still being analyzed".into())));

        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::StillRunning]);
        let sub = &h.sub_tasks(master.id)[0];
        assert!(sub.status.is_outstanding());
        assert!(h.shared.snapshots.get(sub.id).is_some());
    }

    #[tokio::test]
    async fn transient_remote_failure_is_retried() {
        let h = Harness::new().await;
        let master = submitted(&h, 1, Utc::now()).await;
        h.cape
            .push_poll(Ok(remote(RemoteState::Failed { transient: true }, "failed_analysis")));

        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::Retrying]);
        let sub = &h.sub_tasks(master.id)[0];
        assert_eq!(sub.status, SubTaskStatus::Pending);
        assert_eq!(sub.retry_count, 1);
        assert!(sub.external_task_id.is_none());
        assert!(
            sub.error_message
                .as_deref()
                .unwrap_or("")
                .contains("failed_analysis")
        );
    }

    #[tokio::test]
    async fn poll_errors_back_off_then_fail_transient() {
        let mut execution = fast_execution();
        execution.retry = RetryPolicy {
            max_attempts: 1,
            jitter: false,
            ..RetryPolicy::default()
        };
        let h = Harness::with_execution(execution).await;
        let master = submitted(&h, 1, Utc::now()).await;
        let sub_id = h.sub_tasks(master.id)[0].id;

        h.cape.push_poll(Err(BackendError::Transport("connection reset".into())));
        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::PollError]);
        assert_eq!(h.shared.snapshots.get(sub_id).unwrap().poll_failures, 1);
        assert!(!h.shared.snapshots.due(sub_id, Instant::now()));

        h.shared.snapshots.defer(sub_id, Instant::now());
        h.cape.push_poll(Err(BackendError::Transport("connection reset".into())));
        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::Failed]);

        let sub = h.store().sub_task(sub_id).unwrap();
        assert_eq!(sub.status, SubTaskStatus::Failed);
        assert!(sub.failure_transient);
        assert_eq!(
            h.store().master_task(master.id).unwrap().status,
            MasterTaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn max_wait_fails_long_running_work() {
        let mut execution = fast_execution();
        execution.max_wait_secs = 1;
        execution.retry = RetryPolicy::disabled();
        let h = Harness::with_execution(execution).await;
        let master = submitted(&h, 1, Utc::now() - chrono::Duration::seconds(30)).await;

        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::Failed]);
        let sub = &h.sub_tasks(master.id)[0];
        assert_eq!(sub.status, SubTaskStatus::Failed);
        assert!(sub.failure_transient);
        assert!(sub.error_message.as_deref().unwrap_or("").contains("max wait"));
    }

    #[tokio::test]
    async fn paused_batches_are_not_polled() {
        let h = Harness::new().await;
        let master = submitted(&h, 2, Utc::now()).await;
        h.store().pause_master(master.id, None, Utc::now()).unwrap();
        assert!(poll_cycle(&h.shared).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_outstanding_sub_task_is_polled_past_one_page() {
        let h = Harness::new().await;
        let inst = h.instance("cape-1", 0).await;
        let n = POLL_PAGE as usize + 1;
        let ids: Vec<String> = (0..n).map(|i| format!("s-{i:04}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let master = h.batch(&refs).await;
        for i in 0..n {
            let sub = h
                .store()
                .claim_next_pending(master.id, inst.id, Utc::now())
                .unwrap()
                .unwrap();
            h.store()
                .record_submitted(sub.id, &format!("ext-{i}"), Utc::now())
                .unwrap();
        }

        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes.len(), n);
        assert!(outcomes.iter().all(|o| *o == PollOutcome::StillRunning));
        assert_eq!(h.store().status_counts(master.id).unwrap().analyzing, n as u32);
        assert_eq!(h.shared.snapshots.len(), n);

        // Nothing is due again yet, and the cache keeps every entry.
        assert!(poll_cycle(&h.shared).await.unwrap().is_empty());
        assert_eq!(h.shared.snapshots.len(), n);
    }

    #[tokio::test]
    async fn time_spent_paused_does_not_count_toward_max_wait() {
        let mut execution = fast_execution();
        execution.max_wait_secs = 60;
        execution.retry = RetryPolicy::disabled();
        let h = Harness::with_execution(execution).await;
        let now = Utc::now();
        let master = submitted(&h, 1, now - chrono::Duration::seconds(600)).await;
        h.store()
            .pause_master(master.id, None, now - chrono::Duration::seconds(590))
            .unwrap();
        h.store().resume_master(master.id, now).unwrap();

        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::StillRunning]);
        assert_eq!(h.sub_tasks(master.id)[0].status, SubTaskStatus::Analyzing);
    }

    #[tokio::test]
    async fn unreadable_batch_does_not_stall_other_batches() {
        let h = Harness::new().await;
        let inst = h.instance("cape-1", 0).await;
        let broken = h.batch(&["a"]).await;
        let healthy = h.batch(&["b"]).await;
        for (i, master) in [&broken, &healthy].into_iter().enumerate() {
            let sub = h
                .store()
                .claim_next_pending(master.id, inst.id, Utc::now())
                .unwrap()
                .unwrap();
            h.store()
                .record_submitted(sub.id, &format!("ext-{i}"), Utc::now())
                .unwrap();
        }
        h.store()
            .execute_raw(&format!(
                "UPDATE master_tasks SET execution = '{{not json' WHERE id = '{}'",
                broken.id
            ))
            .unwrap();

        let outcomes = poll_cycle(&h.shared).await.unwrap();
        assert_eq!(outcomes, vec![PollOutcome::StillRunning]);
        assert_eq!(h.store().status_counts(healthy.id).unwrap().analyzing, 1);
    }

    #[test]
    fn cache_retains_only_live_entries() {
        let cache = SnapshotCache::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let later = Instant::now() + Duration::from_secs(60);
        cache.record_ok(a, "running".into(), serde_json::Value::Null, later);
        cache.record_ok(b, "running".into(), serde_json::Value::Null, later);
        cache.retain(&HashSet::from([b]));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(a).is_none());
        assert!(cache.due(a, Instant::now()));
        assert!(!cache.due(b, Instant::now()));
    }
}
