use chrono::{DateTime, Utc};
use rand::Rng;
use samplefarm_core::{RetryDecision, RetryPolicy};

use crate::model::{SubTask, SubTaskStatus};
use crate::store::{StoreError, TaskStore};

/// A failed submission or poll, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Failure {
    pub(crate) message: String,
    pub(crate) transient: bool,
}

impl Failure {
    pub(crate) fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub(crate) fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// What the controller did with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    /// Re-armed as `pending` behind a gate.
    Retrying {
        attempt: u32,
        at: DateTime<Utc>,
    },
    /// Left `failed`.
    Failed,
    /// The sub-task was paused meanwhile; it resumes as `pending` later.
    Parked,
}

/// When to retry a sub-task that has already been retried `retry_count`
/// times, or `None` when it should fail for good. Permanent failures are
/// never retried.
pub(crate) fn plan_retry<R: Rng + ?Sized>(
    policy: &RetryPolicy,
    retry_count: u32,
    failure: &Failure,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<DateTime<Utc>> {
    if !failure.transient {
        return None;
    }
    match policy.decide_with(retry_count.saturating_add(1), rng) {
        RetryDecision::RetryAfter(delay) => {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
        }
        RetryDecision::Exhausted => None,
    }
}

/// Route a failure through the retry policy and persist the outcome.
pub(crate) async fn handle_failure(
    store: &TaskStore,
    sub: &SubTask,
    policy: &RetryPolicy,
    failure: Failure,
) -> Result<FailureOutcome, StoreError> {
    let now = Utc::now();
    let at = plan_retry(policy, sub.retry_count, &failure, now, &mut rand::rng());
    let attempt = sub.retry_count.saturating_add(1);

    let sub_id = sub.id;
    let message = failure.message.clone();
    let transient = failure.transient;
    let status = store
        .call(move |s| s.record_failure(sub_id, &message, transient, at, now))
        .await?;

    match (status, at) {
        (SubTaskStatus::Pending, Some(at)) => {
            tracing::warn!(
                sub_task_id = %sub.id,
                master_task_id = %sub.master_task_id,
                attempt,
                retry_at = %at,
                error = %failure.message,
                "sub-task failed; retry scheduled"
            );
            Ok(FailureOutcome::Retrying { attempt, at })
        }
        (SubTaskStatus::Paused, _) => Ok(FailureOutcome::Parked),
        _ => {
            tracing::warn!(
                sub_task_id = %sub.id,
                master_task_id = %sub.master_task_id,
                transient = failure.transient,
                error = %failure.message,
                "sub-task failed"
            );
            Ok(FailureOutcome::Failed)
        }
    }
}
