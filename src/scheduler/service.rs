//! Control surface: the operations a host exposes over its own transport.
//!
//! Every operation is tenant-scoped. A job id that belongs to another tenant
//! is reported as not found.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::cron;
use super::engine::ExecutionEngine;
use super::history::ExecutionLogger;
use super::locks::JobLocks;
use super::model::{
    ExecutionRecord, JobDraft, JobFilter, JobId, JobSpec, JobStatus, ScheduledJob,
};
use super::registry::{JobRegistry, RegistryStats};
use super::target::TargetResolver;
use crate::error::{Result, SchedulerError};
use crate::storage::JobStore;

/// Upper bound on fire times returned by a preview.
pub const PREVIEW_CAP: usize = 1000;

const MAX_KEY_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Enable,
    Disable,
    Delete,
    Execute,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Enable => "enable",
            Action::Disable => "disable",
            Action::Delete => "delete",
            Action::Execute => "execute",
        }
    }
}

/// Tenant-scoped authorization, supplied by the host.
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, tenant: &str, user: &str, action: Action, job_id: Option<JobId>) -> Result<()>;
}

/// Permits everything. For single-tenant deployments and tests.
pub struct AllowAll;

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _tenant: &str, _user: &str, _action: Action, _job_id: Option<JobId>) -> Result<()> {
        Ok(())
    }
}

/// Validated policy values extracted from a [`JobSpec`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSpec {
    pub timeout_seconds: u64,
    pub max_consecutive_failures: u32,
    pub next_run_at: DateTime<Utc>,
}

/// Check a definition before anything is written.
pub fn validate_spec(
    key: &str,
    spec: &JobSpec,
    max_timeout_seconds: u64,
    resolver: &dyn TargetResolver,
    now: DateTime<Utc>,
) -> Result<ValidatedSpec> {
    if key.trim().is_empty() {
        return Err(SchedulerError::InvalidPolicy("job key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(SchedulerError::InvalidPolicy(format!(
            "job key must be at most {} bytes",
            MAX_KEY_LEN
        )));
    }
    if spec.name.trim().is_empty() {
        return Err(SchedulerError::InvalidPolicy("name must not be empty".into()));
    }

    let next_run_at = cron::validate_schedule(&spec.cron_expr, &spec.timezone, now)?;

    if spec.timeout_seconds <= 0 {
        return Err(SchedulerError::InvalidPolicy("timeoutSeconds must be positive".into()));
    }
    let timeout_seconds = spec.timeout_seconds as u64;
    if timeout_seconds > max_timeout_seconds {
        return Err(SchedulerError::InvalidPolicy(format!(
            "timeoutSeconds must not exceed {}",
            max_timeout_seconds
        )));
    }

    if spec.max_consecutive_failures <= 0 {
        return Err(SchedulerError::InvalidPolicy(
            "maxConsecutiveFailures must be positive".into(),
        ));
    }
    let max_consecutive_failures = u32::try_from(spec.max_consecutive_failures).map_err(|_| {
        SchedulerError::InvalidPolicy("maxConsecutiveFailures is out of range".into())
    })?;

    if !resolver.contains(&spec.target) {
        return Err(SchedulerError::UnknownTarget(spec.target.clone()));
    }

    Ok(ValidatedSpec {
        timeout_seconds,
        max_consecutive_failures,
        next_run_at,
    })
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    logger: Arc<dyn ExecutionLogger>,
    resolver: Arc<dyn TargetResolver>,
    authorizer: Arc<dyn Authorizer>,
    locks: Arc<JobLocks>,
    registry: JobRegistry,
    max_timeout_seconds: u64,
}

impl JobService {
    /// Wire up the engine and registry around the given collaborators.
    /// The registry is not started.
    pub fn new(
        store: Arc<dyn JobStore>,
        logger: Arc<dyn ExecutionLogger>,
        resolver: Arc<dyn TargetResolver>,
        authorizer: Arc<dyn Authorizer>,
        max_timeout_seconds: u64,
    ) -> Self {
        let locks = Arc::new(JobLocks::new());
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            resolver.clone(),
            logger.clone(),
            locks.clone(),
        ));
        let registry = JobRegistry::new(store.clone(), engine, locks.clone());
        Self {
            store,
            logger,
            resolver,
            authorizer,
            locks,
            registry,
            max_timeout_seconds,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn start(&self) {
        self.registry.start();
    }

    pub async fn stop(&self, grace: Duration) {
        self.registry.stop(grace).await;
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    async fn load_scoped(&self, tenant: &str, id: JobId) -> Result<ScheduledJob> {
        match self.store.get(id).await? {
            Some(job) if job.tenant_id == tenant => Ok(job),
            _ => Err(SchedulerError::NotFound(id)),
        }
    }

    /// Upsert the definition keyed on `(tenant, key)` and re-arm its timer.
    pub async fn create_or_update(&self, tenant: &str, key: &str, user: &str, spec: JobSpec) -> Result<ScheduledJob> {
        self.authorizer.authorize(tenant, user, Action::Create, None).await?;
        let valid = validate_spec(key, &spec, self.max_timeout_seconds, self.resolver.as_ref(), Utc::now())?;

        let existing = self.store.find_by_key(tenant, key).await?;
        let _guard = match &existing {
            Some(job) => Some(self.locks.lock(job.id).await),
            None => None,
        };
        // Re-read under the lock; a run may have finished meanwhile.
        let existing = match existing {
            Some(_) => self.store.find_by_key(tenant, key).await?,
            None => None,
        };

        let (status, consecutive_failure_count) = match (&existing, spec.enabled) {
            (Some(job), true) if job.status == JobStatus::Error => (JobStatus::Active, 0),
            (Some(job), true) => (JobStatus::Active, job.consecutive_failure_count),
            (Some(job), false) if job.status == JobStatus::Error => (JobStatus::Error, job.consecutive_failure_count),
            (Some(job), false) => (JobStatus::Paused, job.consecutive_failure_count),
            (None, true) => (JobStatus::Active, 0),
            (None, false) => (JobStatus::Paused, 0),
        };

        let draft = JobDraft {
            name: spec.name,
            description: spec.description,
            cron_expr: spec.cron_expr,
            timezone: spec.timezone,
            enabled: spec.enabled,
            target: spec.target,
            params: spec.params,
            timeout_seconds: valid.timeout_seconds,
            max_consecutive_failures: valid.max_consecutive_failures,
            status,
            consecutive_failure_count,
            next_run_at: spec.enabled.then_some(valid.next_run_at),
            actor: user.to_string(),
        };

        let job = self.store.upsert(tenant, key, &draft).await?;
        self.registry.arm(&job);
        info!(
            job_id = %job.id,
            tenant = %tenant,
            key = %key,
            created = existing.is_none(),
            enabled = job.enabled,
            "job saved"
        );
        Ok(job)
    }

    pub async fn get_job(&self, tenant: &str, user: &str, id: JobId) -> Result<ScheduledJob> {
        self.authorizer.authorize(tenant, user, Action::Read, Some(id)).await?;
        self.load_scoped(tenant, id).await
    }

    pub async fn find_job(&self, tenant: &str, user: &str, key: &str) -> Result<Option<ScheduledJob>> {
        self.authorizer.authorize(tenant, user, Action::Read, None).await?;
        self.store.find_by_key(tenant, key).await
    }

    pub async fn list_jobs(&self, tenant: &str, user: &str, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        self.authorizer.authorize(tenant, user, Action::Read, None).await?;
        self.store.list(Some(tenant), filter).await
    }

    /// Enable or disable a job. Enabling a job in `error` clears its failure
    /// streak; disabling keeps `error` visible.
    pub async fn set_enabled(&self, tenant: &str, user: &str, id: JobId, enabled: bool) -> Result<ScheduledJob> {
        let action = if enabled { Action::Enable } else { Action::Disable };
        self.authorizer.authorize(tenant, user, action, Some(id)).await?;

        let _guard = self.locks.lock(id).await;
        let job = self.load_scoped(tenant, id).await?;

        let mut state = job.run_state();
        if enabled {
            if job.status == JobStatus::Error {
                state.consecutive_failure_count = 0;
            }
            state.enabled = true;
            state.status = JobStatus::Active;
            state.next_run_at = Some(cron::next_fire_time(&job.cron_expr, &job.timezone, Utc::now())?);
        } else {
            state.enabled = false;
            if job.status != JobStatus::Error {
                state.status = JobStatus::Paused;
            }
            state.next_run_at = None;
        }

        let updated = self.store.update_run_state(id, job.version, &state, Some(user)).await?;
        self.registry.arm(&updated);
        info!(job_id = %id, tenant = %tenant, enabled, by = %user, "job enabled state changed");
        Ok(updated)
    }

    /// Disarm then remove. A run already in progress may finish; its record
    /// is kept.
    pub async fn delete_job(&self, tenant: &str, user: &str, id: JobId) -> Result<()> {
        self.authorizer.authorize(tenant, user, Action::Delete, Some(id)).await?;
        {
            let _guard = self.locks.lock(id).await;
            self.load_scoped(tenant, id).await?;
            self.registry.forget(id);
            if !self.store.delete(id).await? {
                return Err(SchedulerError::NotFound(id));
            }
        }
        self.locks.forget(id);
        info!(job_id = %id, tenant = %tenant, by = %user, "job deleted");
        Ok(())
    }

    /// Execute immediately with `trigger_type = manual`, whatever the job's
    /// enabled state.
    pub async fn run_now(
        &self,
        tenant: &str,
        user: &str,
        id: JobId,
        cancel: CancellationToken,
    ) -> Result<ExecutionRecord> {
        self.authorizer.authorize(tenant, user, Action::Execute, Some(id)).await?;
        self.load_scoped(tenant, id).await?;
        let outcome = self.registry.run_now(id, Some(user), cancel).await?;
        Ok(outcome.record)
    }

    /// Arm every enabled, non-error job. With a tenant, only that tenant's
    /// timers are touched.
    pub async fn bootstrap_on_startup(&self, tenant: Option<&str>) -> Result<usize> {
        let armed = self.reconcile_from_store(tenant).await?;
        info!(tenant = tenant.unwrap_or("*"), armed, "scheduler bootstrapped");
        Ok(armed)
    }

    /// Periodic resync against the store.
    pub async fn resync(&self) -> Result<usize> {
        let armed = self.reconcile_from_store(None).await?;
        debug!(armed, "scheduler resynced");
        Ok(armed)
    }

    async fn reconcile_from_store(&self, tenant: Option<&str>) -> Result<usize> {
        let jobs = self.store.list_enabled(tenant).await?;
        Ok(match tenant {
            Some(t) => self.registry.reconcile_tenant(t, &jobs),
            None => self.registry.reconcile(&jobs),
        })
    }

    /// Newest execution records first.
    pub async fn history(&self, tenant: &str, user: &str, id: JobId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.authorizer.authorize(tenant, user, Action::Read, Some(id)).await?;
        self.load_scoped(tenant, id).await?;
        self.logger.list(id, limit).await
    }

    /// Fire times within the next `hours`, computed without running anything.
    pub async fn preview(&self, tenant: &str, user: &str, id: JobId, hours: u64) -> Result<Vec<DateTime<Utc>>> {
        self.authorizer.authorize(tenant, user, Action::Read, Some(id)).await?;
        let job = self.load_scoped(tenant, id).await?;
        let from = Utc::now();
        let until = from + chrono::Duration::hours(hours.min(24 * 366) as i64);
        cron::upcoming(&job.cron_expr, &job.timezone, from, until, PREVIEW_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::history::MemoryExecutionLog;
    use crate::scheduler::model::{Outcome, Params, TriggerType};
    use crate::scheduler::target::TargetRegistry;
    use crate::storage::MemoryJobStore;
    use serde_json::json;

    struct DenyDeletes;

    #[async_trait::async_trait]
    impl Authorizer for DenyDeletes {
        async fn authorize(&self, _t: &str, user: &str, action: Action, _id: Option<JobId>) -> Result<()> {
            if action == Action::Delete {
                return Err(SchedulerError::Unauthorized(format!("{} may not {}", user, action.as_str())));
            }
            Ok(())
        }
    }

    fn targets() -> TargetRegistry {
        let mut t = TargetRegistry::new();
        t.register_fn("ok", |_, _| async move { Ok(json!({"ok": true})) });
        t.register_fn("fail", |_, _| async move { anyhow::bail!("nope") });
        t
    }

    fn service_with(authorizer: Arc<dyn Authorizer>) -> (Arc<MemoryJobStore>, JobService) {
        let store = Arc::new(MemoryJobStore::new());
        let svc = JobService::new(
            store.clone(),
            Arc::new(MemoryExecutionLog::new()),
            Arc::new(targets()),
            authorizer,
            3600,
        );
        svc.start();
        (store, svc)
    }

    fn service() -> (Arc<MemoryJobStore>, JobService) {
        service_with(Arc::new(AllowAll))
    }

    fn spec(target: &str) -> JobSpec {
        JobSpec {
            name: "Nightly export".into(),
            description: Some("exports".into()),
            cron_expr: "0 2 * * *".into(),
            timezone: "Europe/Berlin".into(),
            enabled: true,
            target: target.into(),
            params: Params::new(),
            timeout_seconds: 30,
            max_consecutive_failures: 2,
        }
    }

    #[test]
    fn test_validation_rejects_bad_policy() {
        let t = targets();
        let now = Utc::now();
        let check = |s: JobSpec| validate_spec("k", &s, 60, &t, now);

        let mut s = spec("ok");
        s.max_consecutive_failures = 0;
        assert!(matches!(check(s), Err(SchedulerError::InvalidPolicy(_))));

        let mut s = spec("ok");
        s.timeout_seconds = -1;
        assert!(matches!(check(s), Err(SchedulerError::InvalidPolicy(_))));

        let mut s = spec("ok");
        s.timeout_seconds = 61;
        assert!(matches!(check(s), Err(SchedulerError::InvalidPolicy(_))));

        let mut s = spec("ok");
        s.cron_expr = "61 * * * *".into();
        assert!(matches!(check(s), Err(SchedulerError::InvalidCron { .. })));

        let mut s = spec("ok");
        s.timezone = "Mars/Olympus".into();
        assert!(matches!(check(s), Err(SchedulerError::UnknownTimezone(_))));

        assert!(matches!(check(spec("ghost")), Err(SchedulerError::UnknownTarget(_))));
        assert!(validate_spec("", &spec("ok"), 60, &t, now).is_err());
        assert!(check(spec("ok")).is_ok());
    }

    #[tokio::test]
    async fn test_create_is_upsert_per_tenant_key() {
        let (_store, svc) = service();
        let a = svc.create_or_update("acme", "export", "alice", spec("ok")).await.unwrap();
        assert!(a.next_run_at.is_some());
        assert!(svc.registry().is_armed(a.id));

        let mut changed = spec("ok");
        changed.cron_expr = "30 3 * * *".into();
        let b = svc.create_or_update("acme", "export", "bob", changed).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.cron_expr, "30 3 * * *");
        assert_eq!(b.created_by, "alice");
        assert_eq!(b.updated_by, "bob");

        let other = svc.create_or_update("globex", "export", "carol", spec("ok")).await.unwrap();
        assert_ne!(other.id, a.id);
        assert_eq!(svc.list_jobs("acme", "alice", &JobFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_threshold_persists_nothing() {
        let (store, svc) = service();
        let mut s = spec("ok");
        s.max_consecutive_failures = 0;
        let err = svc.create_or_update("acme", "export", "alice", s).await.unwrap_err();
        assert!(err.is_validation());
        assert!(store.find_by_key("acme", "export").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_job_has_no_next_run() {
        let (_store, svc) = service();
        let mut s = spec("ok");
        s.enabled = false;
        let job = svc.create_or_update("acme", "export", "alice", s).await.unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert!(job.next_run_at.is_none());
        assert!(!svc.registry().is_armed(job.id));
    }

    #[tokio::test]
    async fn test_reenable_after_error_resets_streak() {
        let (_store, svc) = service();
        let job = svc.create_or_update("acme", "flaky", "alice", spec("fail")).await.unwrap();
        for _ in 0..2 {
            svc.run_now("acme", "alice", job.id, CancellationToken::new()).await.unwrap();
        }
        let tripped = svc.get_job("acme", "alice", job.id).await.unwrap();
        assert_eq!(tripped.status, JobStatus::Error);
        assert!(!tripped.enabled);
        assert!(!svc.registry().is_armed(job.id));

        let disabled = svc.set_enabled("acme", "alice", job.id, false).await.unwrap();
        assert_eq!(disabled.status, JobStatus::Error);

        let back = svc.set_enabled("acme", "alice", job.id, true).await.unwrap();
        assert_eq!(back.status, JobStatus::Active);
        assert_eq!(back.consecutive_failure_count, 0);
        assert!(back.next_run_at.is_some());
        assert!(svc.registry().is_armed(job.id));
    }

    #[tokio::test]
    async fn test_run_now_on_disabled_job_records_manual_run() {
        let (_store, svc) = service();
        let mut s = spec("ok");
        s.enabled = false;
        let job = svc.create_or_update("acme", "export", "alice", s).await.unwrap();

        let record = svc.run_now("acme", "bob", job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(record.trigger_type, TriggerType::Manual);
        assert_eq!(record.outcome, Outcome::Success);
        assert_eq!(record.triggered_by.as_deref(), Some("bob"));

        let history = svc.history("acme", "bob", job.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        let after = svc.get_job("acme", "bob", job.id).await.unwrap();
        assert!(!after.enabled);
    }

    #[tokio::test]
    async fn test_other_tenant_sees_not_found() {
        let (_store, svc) = service();
        let job = svc.create_or_update("acme", "export", "alice", spec("ok")).await.unwrap();
        assert!(matches!(
            svc.set_enabled("globex", "mallory", job.id, false).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(
            svc.delete_job("globex", "mallory", job.id).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_disarms_and_authorizer_is_consulted() {
        let (_store, svc) = service();
        let job = svc.create_or_update("acme", "export", "alice", spec("ok")).await.unwrap();
        svc.delete_job("acme", "alice", job.id).await.unwrap();
        assert!(!svc.registry().is_armed(job.id));
        assert!(svc.find_job("acme", "alice", "export").await.unwrap().is_none());

        let (_store, guarded) = service_with(Arc::new(DenyDeletes));
        let job = guarded.create_or_update("acme", "export", "alice", spec("ok")).await.unwrap();
        assert!(matches!(
            guarded.delete_job("acme", "alice", job.id).await,
            Err(SchedulerError::Unauthorized(_))
        ));
        assert!(guarded.registry().is_armed(job.id));
    }

    #[tokio::test]
    async fn test_preview_lists_fire_times() {
        let (_store, svc) = service();
        let mut s = spec("ok");
        s.cron_expr = "0 * * * *".into();
        s.timezone = "UTC".into();
        let job = svc.create_or_update("acme", "hourly", "alice", s).await.unwrap();
        let times = svc.preview("acme", "alice", job.id, 5).await.unwrap();
        assert!(times.len() == 5 || times.len() == 4);
        assert!(times.windows(2).all(|w| w[1] - w[0] == chrono::Duration::hours(1)));
    }

    #[tokio::test]
    async fn test_resync_rearms_missing_timers() {
        let (_store, svc) = service();
        let job = svc.create_or_update("acme", "export", "alice", spec("ok")).await.unwrap();
        svc.registry().disarm(job.id);
        assert!(!svc.registry().is_armed(job.id));

        assert_eq!(svc.resync().await.unwrap(), 1);
        assert!(svc.registry().is_armed(job.id));
    }
}
