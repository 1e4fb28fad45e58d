use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;

use crate::api::EngineEvent;
use crate::backend::BackendError;
use crate::engine::Shared;
use crate::model::{AnalyzerInstance, InstanceHealth};
use crate::store::StoreError;

fn due(instance: &AnalyzerInstance, now: DateTime<Utc>) -> bool {
    if !instance.enabled {
        return false;
    }
    let secs = instance.health_check_interval.clamp(1, 86_400);
    let interval = chrono::Duration::seconds(i64::try_from(secs).unwrap_or(86_400));
    instance
        .last_health_check
        .is_none_or(|last| last + interval <= now)
}

/// Probe every enabled instance whose health check interval has elapsed.
/// Returns the number of instances probed.
pub(crate) async fn probe_due(shared: &Arc<Shared>) -> Result<usize, StoreError> {
    let instances = shared.store.call(|s| s.list_instances(None)).await?;
    let now = Utc::now();

    let mut probes = JoinSet::new();
    for instance in instances.into_iter().filter(|i| due(i, now)) {
        let Some(client) = shared.backends.get(instance.analyzer_type) else {
            continue;
        };
        probes.spawn(async move {
            let budget = instance.timeout().min(Duration::from_secs(30));
            let res = tokio::time::timeout(budget, client.health_check(&instance))
                .await
                .unwrap_or(Err(BackendError::Timeout));
            (instance, res)
        });
    }

    let mut probed = 0;
    while let Some(joined) = probes.join_next().await {
        let Ok((instance, res)) = joined else {
            continue;
        };
        probed += 1;
        let health = match &res {
            Ok(()) => InstanceHealth::Healthy,
            Err(err) => {
                tracing::debug!(instance = %instance.name, error = %err, "health probe failed");
                InstanceHealth::Unhealthy
            }
        };

        let id = instance.id;
        shared
            .store
            .call(move |s| s.record_health(id, health, Utc::now()))
            .await?;

        if health != instance.status {
            match &res {
                Ok(()) => tracing::info!(instance = %instance.name, "instance healthy"),
                Err(err) => {
                    tracing::warn!(instance = %instance.name, error = %err, "instance unhealthy")
                }
            }
            shared.emit(EngineEvent::InstanceHealthChanged {
                instance_id: instance.id,
                name: instance.name,
                status: health,
            });
        }
    }
    Ok(probed)
}

/// Keep instance health current until the engine stops.
pub(crate) async fn run_health_loop(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.cfg.health_tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shared.inner.stopped() => break,
        }
        if let Err(err) = probe_due(&shared).await {
            tracing::warn!(error = %err, "health check cycle failed");
        }
    }
    tracing::debug!("health checker exited");
}
