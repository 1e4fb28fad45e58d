//! Startup recovery scanner and the failed-task sweep.
//!
//! The scanner repairs what a crash can leave behind: sub-tasks stuck in
//! `submitting`, and batches whose sub-tasks all finished without the batch
//! being finalized. Rows this process is still submitting are never reset.
//! The sweep re-arms transiently failed sub-tasks once their
//! batch's sweep policy says they are due. Both are idempotent.

use std::sync::Arc;

use chrono::Utc;
use samplefarm_core::RecoveryConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::api::EngineEvent;
use crate::claims::ClaimRegistry;
use crate::engine::Shared;
use crate::store::{StoreError, TaskStore};

/// What one recovery scan changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Sub-tasks found stuck in `submitting`.
    pub stuck_found: u32,
    /// Stuck sub-tasks reset to `pending`.
    pub reset: u32,
    /// Old `submitting` rows left alone because their submission is live.
    pub in_flight: u32,
    /// Batches finalized by the scan.
    pub finalized: u32,
}

impl RecoveryStats {
    /// Whether the scan changed anything.
    pub fn is_noop(&self) -> bool {
        self.reset == 0 && self.finalized == 0
    }
}

/// What one failed-task sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    /// Failed sub-tasks considered.
    pub examined: u32,
    /// Sub-tasks re-armed as `pending`.
    pub rearmed: u32,
}

/// Sweep candidates examined per pass.
pub const SWEEP_BATCH: u32 = 200;

/// Run one recovery scan.
///
/// Stuck sub-tasks are reset to `pending` with their retry count unchanged,
/// at most `batch_size` per scan and `global_concurrency` at a time. A second
/// scan right after the first changes nothing.
pub async fn scan_once(
    store: &TaskStore,
    cfg: &RecoveryConfig,
) -> Result<RecoveryStats, StoreError> {
    scan(store, cfg, &ClaimRegistry::default()).await
}

/// A scan that skips sub-tasks in `claims`.
pub(crate) async fn scan(
    store: &TaskStore,
    cfg: &RecoveryConfig,
    claims: &ClaimRegistry,
) -> Result<RecoveryStats, StoreError> {
    let now = Utc::now();
    let threshold = chrono::Duration::from_std(cfg.stuck_threshold())
        .unwrap_or(chrono::Duration::MAX);
    let cutoff = now.checked_sub_signed(threshold).unwrap_or(now);
    let batch = cfg.batch_size.max(1);

    let stuck = store
        .call(move |s| s.list_stuck_submitting(cutoff, batch))
        .await?;
    let mut stats = RecoveryStats {
        stuck_found: u32::try_from(stuck.len()).unwrap_or(u32::MAX),
        ..RecoveryStats::default()
    };

    let limit = Arc::new(Semaphore::new(cfg.global_concurrency.max(1) as usize));
    let mut resets = JoinSet::new();
    for sub in stuck {
        if claims.contains(sub.id) {
            stats.in_flight += 1;
            tracing::debug!(sub_task_id = %sub.id, "submission still in flight; not resetting");
            continue;
        }
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let store = store.clone();
        let claims = claims.clone();
        resets.spawn(async move {
            let sub_id = sub.id;
            let res = store
                .call(move |s| {
                    s.reset_stuck_submitting_unless(sub_id, cutoff, Utc::now(), |id| {
                        claims.contains(id)
                    })
                })
                .await;
            drop(permit);
            (sub, res)
        });
    }
    while let Some(joined) = resets.join_next().await {
        let Ok((sub, res)) = joined else {
            continue;
        };
        match res {
            Ok(true) => {
                stats.reset += 1;
                tracing::info!(
                    sub_task_id = %sub.id,
                    master_task_id = %sub.master_task_id,
                    retry_count = sub.retry_count,
                    "reset stuck submission"
                );
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(sub_task_id = %sub.id, error = %err, "resetting stuck submission failed")
            }
        }
    }

    let unfinalized = store.call(|s| s.list_unfinalized_masters()).await?;
    for master_id in unfinalized {
        match store
            .call(move |s| s.refresh_rollup(master_id, Utc::now()))
            .await
        {
            Ok(Some(status)) => {
                stats.finalized += 1;
                tracing::info!(master_task_id = %master_id, %status, "finalized batch during recovery");
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(master_task_id = %master_id, error = %err, "finalizing batch failed")
            }
        }
    }

    if stats.is_noop() {
        tracing::debug!(
            stuck_found = stats.stuck_found,
            in_flight = stats.in_flight,
            "recovery scan found nothing to do"
        );
    } else {
        tracing::info!(
            stuck_found = stats.stuck_found,
            reset = stats.reset,
            finalized = stats.finalized,
            "recovery scan finished"
        );
    }
    Ok(stats)
}

/// Re-arm transiently failed sub-tasks whose sweep is due.
///
/// A sub-task qualifies while its batch policy allows another sweep and its
/// failure is older than the policy's delay. Re-arming resets the in-line
/// retry count and reopens a finalized batch.
pub async fn sweep_once(store: &TaskStore, limit: u32) -> Result<SweepStats, StoreError> {
    let candidates = store
        .call(move |s| s.list_sweep_candidates(limit.max(1)))
        .await?;
    let now = Utc::now();
    let mut stats = SweepStats::default();

    for candidate in candidates {
        stats.examined += 1;
        let sub = candidate.sub_task;
        if !candidate.policy.allows(sub.sweep_count + 1) {
            continue;
        }
        let wait = chrono::Duration::from_std(candidate.policy.due_after(sub.sweep_count))
            .unwrap_or(chrono::Duration::MAX);
        let failed_at = sub.completed_at.unwrap_or(sub.updated_at);
        if failed_at.checked_add_signed(wait).is_none_or(|due| due > now) {
            continue;
        }

        let sub_id = sub.id;
        if store.call(move |s| s.rearm_failed(sub_id, Utc::now())).await? {
            stats.rearmed += 1;
            tracing::info!(
                sub_task_id = %sub.id,
                master_task_id = %sub.master_task_id,
                sweep = sub.sweep_count + 1,
                "re-armed failed sub-task"
            );
        }
    }
    Ok(stats)
}

/// Scan once after the initial delay, then on every scan interval.
pub(crate) async fn run_recovery_loop(shared: Arc<Shared>) {
    let cfg = shared.cfg.recovery.clone();
    if !cfg.enabled {
        tracing::info!("recovery scanner disabled");
        shared.inner.stopped().await;
        return;
    }

    tokio::select! {
        _ = tokio::time::sleep(cfg.initial_delay()) => {}
        _ = shared.inner.stopped() => return,
    }
    let mut tick = tokio::time::interval(cfg.scan_interval().max(std::time::Duration::from_secs(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shared.inner.stopped() => break,
        }
        match scan(&shared.store, &cfg, &shared.claims).await {
            Ok(stats) => {
                if let Ok(mut last) = shared.last_recovery.lock() {
                    *last = Some(stats);
                }
                if stats.reset > 0 {
                    // Reset work belongs to running batches; wake their dispatchers.
                    shared.inner.nudge.notify_one();
                }
                shared.emit(EngineEvent::RecoveryCompleted { stats });
            }
            Err(err) => {
                tracing::warn!(error = %err, "recovery scan failed");
                shared.emit(EngineEvent::Warning {
                    message: format!("recovery scan failed: {err}"),
                });
            }
        }
    }
    tracing::debug!("recovery scanner exited");
}

/// Run the failed-task sweep on every sweep tick.
pub(crate) async fn run_sweep_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.cfg.sweep_tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shared.inner.stopped() => break,
        }
        match sweep_once(&shared.store, SWEEP_BATCH).await {
            Ok(stats) if stats.rearmed > 0 => {
                shared.inner.nudge.notify_one();
                shared.emit(EngineEvent::SweepCompleted { stats });
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "failed-task sweep failed");
            }
        }
    }
    tracing::debug!("failed-task sweep exited");
}
