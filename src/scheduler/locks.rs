//! Per-job serialization of run-state writes.
//!
//! Control-surface mutations (enable, disable, delete, update) and the
//! completion of a run on the same job take the same lock, so a disable can
//! never interleave with a run writing its outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::model::JobId;

#[derive(Default)]
pub struct JobLocks {
    locks: Mutex<HashMap<JobId, Arc<AsyncMutex<()>>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: JobId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Take the lock only if nobody holds it right now.
    pub fn try_lock(&self, id: JobId) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(id).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }

    /// Drop the lock entry for a deleted job once nobody holds or awaits it.
    pub fn forget(&self, id: JobId) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = locks.get(&id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn test_same_job_is_serialized() {
        let locks = Arc::new(JobLocks::new());
        let id = Uuid::new_v4();

        let guard = locks.lock(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_jobs_do_not_block() {
        let locks = JobLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        let _b = locks.lock(Uuid::new_v4()).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_try_lock_refuses_held_lock() {
        let locks = JobLocks::new();
        let id = Uuid::new_v4();
        let held = locks.try_lock(id).unwrap();
        assert!(locks.try_lock(id).is_none());
        drop(held);
        assert!(locks.try_lock(id).is_some());
    }

    #[tokio::test]
    async fn test_forget_keeps_held_locks() {
        let locks = JobLocks::new();
        let id = Uuid::new_v4();
        let guard = locks.lock(id).await;
        locks.forget(id);
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.forget(id);
        assert_eq!(locks.len(), 0);
    }
}
