use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::model::{AnalyzerInstance, AnalyzerType, InstanceHealth};
use crate::store::{StoreError, TaskStore};

type Reservations = Arc<Mutex<HashMap<Uuid, u32>>>;

/// Round-robin instance selection with capacity accounting.
///
/// Live work is counted from the store; a lease covers the short window
/// between selection and the claim that makes the work visible there.
#[derive(Debug, Default)]
pub(crate) struct InstancePool {
    cursors: Mutex<HashMap<AnalyzerType, usize>>,
    reserved: Reservations,
}

/// A reserved slot on one instance. Released on drop.
#[derive(Debug)]
pub(crate) struct InstanceLease {
    instance: AnalyzerInstance,
    reserved: Reservations,
}

impl InstanceLease {
    pub(crate) fn instance(&self) -> &AnalyzerInstance {
        &self.instance
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if let Ok(mut map) = self.reserved.lock() {
            if let Some(n) = map.get_mut(&self.instance.id) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    map.remove(&self.instance.id);
                }
            }
        }
    }
}

fn eligible(instance: &AnalyzerInstance, analyzer: AnalyzerType, allow: &[Uuid]) -> bool {
    instance.analyzer_type == analyzer
        && instance.enabled
        && instance.status == InstanceHealth::Healthy
        && (allow.is_empty() || allow.contains(&instance.id))
}

impl InstancePool {
    /// Pick an instance from a store view. `None` means no capacity right now.
    pub(crate) fn select(
        &self,
        instances: &[AnalyzerInstance],
        inflight: &HashMap<Uuid, u32>,
        analyzer: AnalyzerType,
        allow: &[Uuid],
    ) -> Option<InstanceLease> {
        let candidates: Vec<&AnalyzerInstance> = instances
            .iter()
            .filter(|i| eligible(i, analyzer, allow))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut cursors = self.cursors.lock().ok()?;
        let mut reserved = self.reserved.lock().ok()?;
        let cursor = cursors.entry(analyzer).or_insert(0);
        let start = *cursor % candidates.len();

        for offset in 0..candidates.len() {
            let idx = (start + offset) % candidates.len();
            let instance = candidates[idx];
            let live = inflight.get(&instance.id).copied().unwrap_or(0)
                + reserved.get(&instance.id).copied().unwrap_or(0);
            if instance.max_concurrent_tasks != 0 && live >= instance.max_concurrent_tasks {
                continue;
            }
            *cursor = idx + 1;
            *reserved.entry(instance.id).or_insert(0) += 1;
            return Some(InstanceLease {
                instance: instance.clone(),
                reserved: self.reserved.clone(),
            });
        }
        None
    }

    /// Read instances and live counts from the store, then [`Self::select`].
    pub(crate) async fn acquire(
        &self,
        store: &TaskStore,
        analyzer: AnalyzerType,
        allow: &[Uuid],
    ) -> Result<Option<InstanceLease>, StoreError> {
        let (instances, inflight) = store
            .call(move |s| Ok((s.list_instances(Some(analyzer))?, s.inflight_by_instance()?)))
            .await?;
        Ok(self.select(&instances, &inflight, analyzer, allow))
    }
}
