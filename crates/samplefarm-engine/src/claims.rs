use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

type Claimed = Arc<Mutex<HashSet<Uuid>>>;

/// Sub-tasks this process has claimed and is still submitting.
///
/// A claim is registered inside the store transaction that moves the row to
/// `submitting`, and the recovery scan consults the registry under the same
/// store lock before it resets a row. A live submission is therefore never
/// mistaken for one interrupted by a crash.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClaimRegistry {
    claimed: Claimed,
}

/// One registered claim. Released on drop, after the outcome is recorded.
#[derive(Debug)]
pub(crate) struct ClaimGuard {
    sub_id: Uuid,
    claimed: Claimed,
}

impl ClaimRegistry {
    pub(crate) fn register(&self, sub_id: Uuid) -> ClaimGuard {
        if let Ok(mut set) = self.claimed.lock() {
            set.insert(sub_id);
        }
        ClaimGuard {
            sub_id,
            claimed: self.claimed.clone(),
        }
    }

    /// A poisoned registry reports every row as live, so nothing is reset.
    pub(crate) fn contains(&self, sub_id: Uuid) -> bool {
        self.claimed
            .lock()
            .map(|set| set.contains(&sub_id))
            .unwrap_or(true)
    }

    pub(crate) fn len(&self) -> usize {
        self.claimed.lock().map(|set| set.len()).unwrap_or(0)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.claimed.lock() {
            set.remove(&self.sub_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let registry = ClaimRegistry::default();
        let id = Uuid::new_v4();
        let guard = registry.register(id);
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        drop(guard);
        assert!(!registry.contains(id));
        assert_eq!(registry.len(), 0);
    }
}
