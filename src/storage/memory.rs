//! In-memory job store with the same contract as the SQLite backend.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::JobStore;
use crate::error::{Result, SchedulerError};
use crate::scheduler::model::{JobDraft, JobFilter, JobId, RunState, ScheduledJob};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, ScheduledJob>,
    by_key: HashMap<(String, String), JobId>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut jobs: Vec<ScheduledJob>) -> Vec<ScheduledJob> {
    jobs.sort_by(|a, b| (&a.tenant_id, &a.job_key).cmp(&(&b.tenant_id, &b.job_key)));
    jobs
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: JobId) -> Result<Option<ScheduledJob>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn find_by_key(&self, tenant: &str, key: &str) -> Result<Option<ScheduledJob>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_key
            .get(&(tenant.to_string(), key.to_string()))
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn upsert(&self, tenant: &str, key: &str, draft: &JobDraft) -> Result<ScheduledJob> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let lookup = (tenant.to_string(), key.to_string());

        if let Some(id) = inner.by_key.get(&lookup).copied() {
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or_else(|| SchedulerError::Storage(format!("key index points at missing job {}", id)))?;
            job.name = draft.name.clone();
            job.description = draft.description.clone();
            job.cron_expr = draft.cron_expr.clone();
            job.timezone = draft.timezone.clone();
            job.enabled = draft.enabled;
            job.target = draft.target.clone();
            job.params = draft.params.clone();
            job.timeout_seconds = draft.timeout_seconds;
            job.max_consecutive_failures = draft.max_consecutive_failures;
            job.status = draft.status;
            job.consecutive_failure_count = draft.consecutive_failure_count;
            job.next_run_at = draft.next_run_at;
            job.updated_by = draft.actor.clone();
            job.updated_at = now;
            job.version += 1;
            return Ok(job.clone());
        }

        let job = ScheduledJob {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            job_key: key.to_string(),
            name: draft.name.clone(),
            description: draft.description.clone(),
            cron_expr: draft.cron_expr.clone(),
            timezone: draft.timezone.clone(),
            enabled: draft.enabled,
            target: draft.target.clone(),
            params: draft.params.clone(),
            timeout_seconds: draft.timeout_seconds,
            max_consecutive_failures: draft.max_consecutive_failures,
            status: draft.status,
            consecutive_failure_count: draft.consecutive_failure_count,
            last_run_at: None,
            next_run_at: draft.next_run_at,
            last_error: None,
            last_result: None,
            created_by: draft.actor.clone(),
            updated_by: draft.actor.clone(),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        inner.by_key.insert(lookup, job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn update_run_state(
        &self,
        id: JobId,
        expected_version: i64,
        state: &RunState,
        actor: Option<&str>,
    ) -> Result<ScheduledJob> {
        let mut inner = self.inner.write().await;
        let job = inner.jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        if job.version != expected_version {
            return Err(SchedulerError::StaleUpdate { id, expected: expected_version });
        }
        job.apply_run_state(state.clone());
        if let Some(actor) = actor {
            job.updated_by = actor.to_string();
        }
        job.updated_at = Utc::now();
        job.version += 1;
        Ok(job.clone())
    }

    async fn list(&self, tenant: Option<&str>, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        let inner = self.inner.read().await;
        let jobs = inner
            .jobs
            .values()
            .filter(|j| tenant.map_or(true, |t| j.tenant_id == t))
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        Ok(sorted(jobs)
            .into_iter()
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn list_enabled(&self, tenant: Option<&str>) -> Result<Vec<ScheduledJob>> {
        let inner = self.inner.read().await;
        let jobs = inner
            .jobs
            .values()
            .filter(|j| tenant.map_or(true, |t| j.tenant_id == t))
            .filter(|j| j.is_schedulable())
            .cloned()
            .collect();
        Ok(sorted(jobs))
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.jobs.remove(&id) {
            Some(job) => {
                inner.by_key.remove(&(job.tenant_id, job.job_key));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::model::JobStatus;

    fn draft() -> JobDraft {
        JobDraft {
            name: "Cleanup".into(),
            description: None,
            cron_expr: "0 * * * *".into(),
            timezone: "UTC".into(),
            enabled: true,
            target: "noop".into(),
            params: Default::default(),
            timeout_seconds: 10,
            max_consecutive_failures: 2,
            status: JobStatus::Active,
            consecutive_failure_count: 0,
            next_run_at: None,
            actor: "system".into(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_version_checks() {
        let store = MemoryJobStore::new();
        let a = store.upsert("acme", "cleanup", &draft()).await.unwrap();
        let b = store.upsert("acme", "cleanup", &draft()).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.version, 2);

        let state = b.run_state();
        assert!(matches!(
            store.update_run_state(a.id, a.version, &state, None).await,
            Err(SchedulerError::StaleUpdate { .. })
        ));
        let c = store.update_run_state(a.id, b.version, &state, Some("bob")).await.unwrap();
        assert_eq!(c.updated_by, "bob");
        assert_eq!(c.version, 3);
    }

    #[tokio::test]
    async fn test_delete_frees_key() {
        let store = MemoryJobStore::new();
        let a = store.upsert("acme", "cleanup", &draft()).await.unwrap();
        assert!(store.delete(a.id).await.unwrap());
        assert!(store.find_by_key("acme", "cleanup").await.unwrap().is_none());
        let b = store.upsert("acme", "cleanup", &draft()).await.unwrap();
        assert_ne!(a.id, b.id);
    }
}
