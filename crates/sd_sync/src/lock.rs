use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// In-process registry of datasources with a run in flight. Non-blocking: a second
/// claim on the same id is refused rather than queued.
#[derive(Debug, Default)]
pub struct SyncLocks {
    running: Mutex<HashSet<i64>>,
}

impl SyncLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(self: &Arc<Self>, datasource_id: i64) -> Option<SyncGuard> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(datasource_id) {
            return None;
        }
        Some(SyncGuard {
            locks: Arc::clone(self),
            datasource_id,
        })
    }

    pub fn is_running(&self, datasource_id: i64) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&datasource_id)
    }
}

/// Releases the datasource when dropped.
#[derive(Debug)]
pub struct SyncGuard {
    locks: Arc<SyncLocks>,
    datasource_id: i64,
}

impl SyncGuard {
    pub fn datasource_id(&self) -> i64 {
        self.datasource_id
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.locks
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.datasource_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_until_guard_drops() {
        let locks = SyncLocks::new();
        let guard = locks.try_acquire(1).expect("first claim");
        assert!(locks.try_acquire(1).is_none());
        assert!(locks.try_acquire(2).is_some());
        assert!(locks.is_running(1));

        drop(guard);
        assert!(!locks.is_running(1));
        assert!(locks.try_acquire(1).is_some());
    }
}
