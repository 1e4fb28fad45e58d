use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use samplefarm_core::RetryPolicy;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::api::EngineEvent;
use crate::backend::{BackendError, SubmitParams};
use crate::claims::ClaimGuard;
use crate::engine::Shared;
use crate::model::{AnalyzerInstance, MasterTaskStatus, SubTask, SubTaskStatus};
use crate::retry::{Failure, FailureOutcome, handle_failure};
use crate::store::StoreError;

/// What one dispatch cycle did for a batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchReport {
    /// The batch is still running.
    pub(crate) active: bool,
    pub(crate) submitted: u32,
    pub(crate) retrying: u32,
    pub(crate) failed: u32,
    /// Work was left pending for lack of an eligible instance.
    pub(crate) deferred: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubmitOutcome {
    Submitted,
    Retrying,
    Failed,
    Dropped,
}

/// Claim and submit pending sub-tasks of one batch until none is eligible or
/// no instance has capacity, then wait for the submissions to settle.
///
/// The rate-limit slot and the global permit are taken before a row is
/// claimed, so a `submitting` row only ages while its upload runs.
pub(crate) async fn dispatch_cycle(
    shared: &Arc<Shared>,
    master_id: Uuid,
) -> Result<DispatchReport, StoreError> {
    let master = shared.store.call(move |s| s.master_task(master_id)).await?;
    let mut report = DispatchReport::default();
    if master.status != MasterTaskStatus::Running {
        return Ok(report);
    }
    report.active = true;

    let execution = shared.execution(&master);
    let limiter = shared.limiters.get(master_id, execution.submit_interval());
    let params = Arc::new(SubmitParams::new(&execution, master.parameters.as_ref()));
    let policy = Arc::new(execution.retry.clone());

    let mut submissions = JoinSet::new();
    loop {
        if shared.inner.should_stop() {
            break;
        }
        let Ok(permit) = shared.permits.clone().acquire_owned().await else {
            break;
        };
        limiter.until_ready().await;

        let Some(lease) = shared
            .pool
            .acquire(&shared.store, master.analyzer_type, &master.instance_ids)
            .await?
        else {
            report.deferred = true;
            break;
        };

        let instance_id = lease.instance().id;
        let claims = shared.claims.clone();
        let claimed = shared
            .store
            .call(move |s| {
                s.claim_next_pending_with(master_id, instance_id, Utc::now(), |id| {
                    claims.register(id)
                })
            })
            .await?;
        let Some((sub, claim)) = claimed else {
            break;
        };
        // The claim is visible to capacity accounting from here on.
        let instance = lease.instance().clone();
        drop(lease);

        submissions.spawn(submit_one(
            shared.clone(),
            sub,
            instance,
            policy.clone(),
            params.clone(),
            (permit, claim),
        ));
    }

    while let Some(res) = submissions.join_next().await {
        match res {
            Ok(SubmitOutcome::Submitted) => report.submitted += 1,
            Ok(SubmitOutcome::Retrying) => report.retrying += 1,
            Ok(SubmitOutcome::Failed) => report.failed += 1,
            Ok(SubmitOutcome::Dropped) => {}
            Err(err) => shared.emit(EngineEvent::Error {
                message: format!("submission task join error: {err}"),
            }),
        }
    }

    if report.submitted + report.retrying + report.failed > 0 {
        tracing::debug!(
            master_task_id = %master_id,
            submitted = report.submitted,
            retrying = report.retrying,
            failed = report.failed,
            deferred = report.deferred,
            "dispatch cycle finished"
        );
    }
    Ok(report)
}

async fn submit_one(
    shared: Arc<Shared>,
    sub: SubTask,
    instance: AnalyzerInstance,
    policy: Arc<RetryPolicy>,
    params: Arc<SubmitParams>,
    _held: (OwnedSemaphorePermit, ClaimGuard),
) -> SubmitOutcome {
    let failure = match submit_remote(&shared, &sub, &instance, &policy, &params).await {
        Ok(external_task_id) => return record_submitted(&shared, &sub, &instance, external_task_id).await,
        Err(failure) => failure,
    };

    match handle_failure(&shared.store, &sub, &policy, failure.clone()).await {
        Ok(outcome) => {
            let will_retry = matches!(outcome, FailureOutcome::Retrying { .. });
            shared.emit(EngineEvent::SubTaskFailed {
                master_task_id: sub.master_task_id,
                sub_task_id: sub.id,
                error: failure.message,
                will_retry,
            });
            match outcome {
                FailureOutcome::Retrying { .. } => SubmitOutcome::Retrying,
                FailureOutcome::Parked => SubmitOutcome::Dropped,
                FailureOutcome::Failed => {
                    shared.note_finalized(sub.master_task_id).await;
                    SubmitOutcome::Failed
                }
            }
        }
        Err(err) => {
            tracing::error!(sub_task_id = %sub.id, error = %err, "recording submission failure failed");
            shared.emit(EngineEvent::Error {
                message: format!("sub-task {}: recording failure: {err}", sub.id),
            });
            SubmitOutcome::Dropped
        }
    }
}

async fn submit_remote(
    shared: &Shared,
    sub: &SubTask,
    instance: &AnalyzerInstance,
    policy: &RetryPolicy,
    params: &SubmitParams,
) -> Result<String, Failure> {
    let sample = shared.samples.resolve(&sub.sample_id).await.map_err(|err| Failure {
        message: err.to_string(),
        transient: err.is_transient(),
    })?;
    let client = shared.backends.get(sub.analyzer_type).ok_or_else(|| {
        Failure::permanent(format!("no adapter registered for {}", sub.analyzer_type))
    })?;

    tracing::debug!(
        sub_task_id = %sub.id,
        sample_id = %sub.sample_id,
        instance = %instance.name,
        attempt = sub.retry_count + 1,
        "submitting sample"
    );
    let res = tokio::time::timeout(
        instance.timeout() + Duration::from_secs(1),
        client.submit(instance, &sample, params),
    )
    .await
    .unwrap_or(Err(BackendError::Timeout));

    res.map_err(|err| Failure {
        transient: err.is_transient(policy),
        message: format!("{}: {err}", instance.name),
    })
}

async fn record_submitted(
    shared: &Shared,
    sub: &SubTask,
    instance: &AnalyzerInstance,
    external_task_id: String,
) -> SubmitOutcome {
    let sub_id = sub.id;
    let ext = external_task_id.clone();
    match shared
        .store
        .call(move |s| s.record_submitted(sub_id, &ext, Utc::now()))
        .await
    {
        Ok(SubTaskStatus::Cancelled) => {
            tracing::info!(
                sub_task_id = %sub.id,
                external_task_id,
                "submission landed after cancel; remote task left running"
            );
            SubmitOutcome::Dropped
        }
        Ok(_) => {
            tracing::info!(
                sub_task_id = %sub.id,
                master_task_id = %sub.master_task_id,
                instance_id = %instance.id,
                external_task_id,
                "sample submitted"
            );
            shared.emit(EngineEvent::SubTaskSubmitted {
                master_task_id: sub.master_task_id,
                sub_task_id: sub.id,
                instance_id: instance.id,
                external_task_id,
            });
            SubmitOutcome::Submitted
        }
        Err(err) => {
            // An invalid transition here is a duplicate submission; the
            // store has already logged it.
            shared.emit(EngineEvent::Error {
                message: format!("sub-task {}: recording submission: {err}", sub.id),
            });
            SubmitOutcome::Dropped
        }
    }
}

/// Drive one batch until it stops running or the engine stops.
pub(crate) async fn run_dispatch_loop(shared: Arc<Shared>, master_id: Uuid) {
    let idle = shared.cfg.dispatch_idle;
    loop {
        if shared.inner.should_stop() {
            break;
        }
        match dispatch_cycle(&shared, master_id).await {
            Ok(report) if !report.active => break,
            Ok(_) => {}
            Err(StoreError::NotFound { .. }) => break,
            Err(err) => {
                tracing::warn!(master_task_id = %master_id, error = %err, "dispatch cycle failed");
                shared.emit(EngineEvent::Warning {
                    message: format!("dispatch for {master_id} failed: {err}"),
                });
            }
        }

        // Wake early when a retry gate opens before the idle sleep ends.
        let wait = match shared.store.call(move |s| s.next_retry_gate(master_id)).await {
            Ok(Some(gate)) => (gate - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(idle),
            _ => idle,
        };
        tokio::select! {
            _ = tokio::time::sleep(wait.max(Duration::from_millis(10))) => {}
            _ = shared.inner.stopped() => break,
        }
    }
    shared.limiters.remove(master_id);
    tracing::debug!(master_task_id = %master_id, "dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, scripted_submit};

    #[tokio::test]
    async fn three_samples_submit_in_one_cycle() {
        let h = Harness::new().await;
        h.instance("cape-1", 5).await;
        let master = h.batch(&["a", "b", "c"]).await;

        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert_eq!(report.submitted, 3);
        let counts = h.store().status_counts(master.id).unwrap();
        assert_eq!(counts.submitted, 3);
        assert_eq!(h.cape.submitted_samples(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn capacity_defers_instead_of_failing() {
        let h = Harness::new().await;
        h.instance("cape-1", 2).await;
        let master = h.batch(&["a", "b", "c"]).await;

        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert_eq!(report.submitted, 2);
        assert!(report.deferred);
        let counts = h.store().status_counts(master.id).unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn no_healthy_instance_leaves_work_pending() {
        let h = Harness::new().await;
        let master = h.batch(&["a"]).await;
        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert!(report.deferred);
        assert_eq!(report.submitted, 0);
        assert_eq!(h.store().status_counts(master.id).unwrap().pending, 1);
    }

    #[tokio::test]
    async fn transient_submit_error_schedules_retry() {
        let h = Harness::new().await;
        h.instance("cape-1", 5).await;
        scripted_submit(&h.cape, Err(BackendError::Http { status: 503, body: String::new() }));
        let master = h.batch(&["a"]).await;

        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert_eq!(report.retrying, 1);
        let subs = h.sub_tasks(master.id);
        assert_eq!(subs[0].status, SubTaskStatus::Pending);
        assert_eq!(subs[0].retry_count, 1);
        assert!(subs[0].next_attempt_at.is_some());

        // Gate in the future: nothing is claimed.
        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert_eq!(report.submitted + report.retrying, 0);
    }

    #[tokio::test]
    async fn permanent_rejection_fails_and_finalizes() {
        let h = Harness::new().await;
        h.instance("cape-1", 5).await;
        scripted_submit(&h.cape, Err(BackendError::Rejected("unsupported file".into())));
        let master = h.batch(&["a"]).await;
        let mut events = h.shared.inner.event_tx.subscribe();

        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert_eq!(report.failed, 1);
        let master = h.store().master_task(master.id).unwrap();
        assert_eq!(master.status, MasterTaskStatus::Failed);

        let mut finalized = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, EngineEvent::MasterFinalized { status: MasterTaskStatus::Failed, .. }) {
                finalized = true;
            }
        }
        assert!(finalized);
    }

    #[tokio::test]
    async fn missing_sample_is_permanent() {
        let h = Harness::new().await;
        h.instance("cape-1", 5).await;
        let master = h.batch(&["not-in-catalog"]).await;
        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert_eq!(report.failed, 1);
        let sub = &h.sub_tasks(master.id)[0];
        assert!(!sub.failure_transient);
        assert!(sub.error_message.as_deref().unwrap_or("").contains("not found"));
    }

    #[tokio::test]
    async fn paused_batch_is_not_dispatched() {
        let h = Harness::new().await;
        h.instance("cape-1", 5).await;
        let master = h.batch(&["a", "b"]).await;
        h.store().pause_master(master.id, Some("maintenance"), Utc::now()).unwrap();

        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert!(!report.active);
        assert!(h.cape.submitted_samples().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn submissions_are_spaced_by_the_rate_limit() {
        let h = Harness::with_execution(samplefarm_core::ExecutionConfig {
            submit_interval_ms: 1_000,
            ..Default::default()
        })
        .await;
        h.instance("cape-1", 0).await;
        let master = h.batch(&["a", "b", "c"]).await;

        let start = tokio::time::Instant::now();
        let report = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert_eq!(report.submitted, 3);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
    #[tokio::test]
    async fn recovery_scan_leaves_live_submissions_alone() {
        let h = Harness::new().await;
        h.instance("cape-1", 5).await;
        let master = h.batch(&["a"]).await;
        h.cape.set_submit_delay(Duration::from_millis(300));

        let shared = h.shared.clone();
        let cycle = tokio::spawn(async move { dispatch_cycle(&shared, master.id).await });
        for _ in 0..200 {
            if h.store().status_counts(master.id).unwrap().submitting == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.store().status_counts(master.id).unwrap().submitting, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A zero threshold makes the live row look abandoned.
        let recovery = samplefarm_core::RecoveryConfig {
            stuck_submitting_threshold_secs: 0,
            ..Default::default()
        };
        let stats = crate::recovery::scan(h.store(), &recovery, &h.shared.claims)
            .await
            .unwrap();
        assert_eq!(stats.stuck_found, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.reset, 0);

        let report = cycle.await.unwrap().unwrap();
        assert_eq!(report.submitted, 1);
        let sub = &h.sub_tasks(master.id)[0];
        assert_eq!(sub.status, SubTaskStatus::Submitted);
        assert!(sub.external_task_id.is_some());
        assert_eq!(h.shared.claims.len(), 0);

        let again = dispatch_cycle(&h.shared, master.id).await.unwrap();
        assert_eq!(again.submitted, 0);
        assert_eq!(h.cape.submitted_samples(), vec!["a"]);
    }
}
