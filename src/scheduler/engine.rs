//! Execution engine: runs one job to completion or timeout and writes the
//! resulting run-state transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cron;
use super::history::{record_best_effort, ExecutionLogger};
use super::locks::JobLocks;
use super::model::{ExecutionRecord, JobStatus, Outcome, RunState, ScheduledJob, TriggerType};
use super::target::{ExecContext, TargetResolver};
use crate::error::SchedulerError;
use crate::storage::JobStore;

/// Key under which execution metadata is merged into the parameter bag.
pub const CONTEXT_PARAM: &str = "_context";

const MAX_WRITE_ATTEMPTS: usize = 3;

/// How a single invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    Success(Value),
    Failure(String),
    Timeout,
    /// Stopped by the caller or by registry shutdown.
    Cancelled,
}

impl InvocationResult {
    pub fn outcome(&self) -> Outcome {
        match self {
            InvocationResult::Success(_) => Outcome::Success,
            InvocationResult::Failure(_) | InvocationResult::Cancelled => Outcome::Failure,
            InvocationResult::Timeout => Outcome::Timeout,
        }
    }

    fn error_message(&self, timeout_seconds: u64) -> Option<String> {
        match self {
            InvocationResult::Success(_) => None,
            InvocationResult::Failure(msg) => Some(msg.clone()),
            InvocationResult::Timeout => Some(format!("execution timed out after {}s", timeout_seconds)),
            InvocationResult::Cancelled => Some(SchedulerError::Cancelled.to_string()),
        }
    }
}

/// Result of [`ExecutionEngine::execute`].
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub record: ExecutionRecord,
    /// The job as persisted after the run; `None` if it was deleted mid-run
    /// or its state could not be written.
    pub job: Option<ScheduledJob>,
    /// The run tripped the failure threshold; the job's timer must go.
    pub disarm: bool,
}

/// Compute the run state that follows an invocation.
///
/// Returns the new state and whether this run tripped the auto-disable
/// threshold. Cancellation records the error but does not count toward the
/// failure streak.
pub fn transition(
    job: &ScheduledJob,
    result: &InvocationResult,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (RunState, bool) {
    let mut state = job.run_state();
    state.last_run_at = Some(started_at);
    let mut tripped = false;

    match result {
        InvocationResult::Success(value) => {
            state.consecutive_failure_count = 0;
            state.last_error = None;
            state.last_result = Some(value.clone());
            if state.enabled {
                state.status = JobStatus::Active;
            }
        }
        InvocationResult::Failure(_) | InvocationResult::Timeout => {
            state.consecutive_failure_count = state.consecutive_failure_count.saturating_add(1);
            state.last_error = result.error_message(job.timeout_seconds);
            if state.consecutive_failure_count >= job.max_consecutive_failures {
                tripped = state.status != JobStatus::Error;
                state.status = JobStatus::Error;
                state.enabled = false;
            }
        }
        InvocationResult::Cancelled => {
            state.last_error = result.error_message(job.timeout_seconds);
        }
    }

    state.next_run_at = if state.enabled {
        match cron::next_fire_time(&job.cron_expr, &job.timezone, now) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not compute next run time");
                None
            }
        }
    } else {
        None
    };

    (state, tripped)
}

pub struct ExecutionEngine {
    store: Arc<dyn JobStore>,
    resolver: Arc<dyn TargetResolver>,
    logger: Arc<dyn ExecutionLogger>,
    locks: Arc<JobLocks>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn TargetResolver>,
        logger: Arc<dyn ExecutionLogger>,
        locks: Arc<JobLocks>,
    ) -> Self {
        Self {
            store,
            resolver,
            logger,
            locks,
        }
    }

    pub fn resolver(&self) -> &Arc<dyn TargetResolver> {
        &self.resolver
    }

    pub fn logger(&self) -> &Arc<dyn ExecutionLogger> {
        &self.logger
    }

    /// Run `job` once. Never fails: every error is folded into the record.
    pub async fn execute(
        &self,
        job: &ScheduledJob,
        trigger_type: TriggerType,
        triggered_by: Option<&str>,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        self.run(job, trigger_type, triggered_by, None, cancel).await
    }

    /// A timer fire for the slot at `scheduled_for`.
    pub async fn execute_scheduled(
        &self,
        job: &ScheduledJob,
        scheduled_for: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        self.run(job, TriggerType::Scheduled, None, Some(scheduled_for), cancel).await
    }

    async fn run(
        &self,
        job: &ScheduledJob,
        trigger_type: TriggerType,
        triggered_by: Option<&str>,
        scheduled_for: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();

        let token = cancel.child_token();
        let ctx = ExecContext {
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            trigger_type,
            triggered_by: triggered_by.map(str::to_string),
            scheduled_for,
            cancel: token.clone(),
        };
        let mut params = job.params.clone();
        params.insert(CONTEXT_PARAM.to_string(), ctx.to_value());

        debug!(job_id = %job.id, target_fn = %job.target, trigger = %trigger_type, "invoking target");
        let result = self.invoke(job, params, ctx, token, &cancel).await;

        let ended_at = Utc::now();
        let duration_ms = clock.elapsed().as_millis() as i64;
        let outcome = result.outcome();

        match &result {
            InvocationResult::Success(_) => {
                info!(job_id = %job.id, duration_ms, trigger = %trigger_type, "job succeeded")
            }
            InvocationResult::Failure(msg) => {
                warn!(job_id = %job.id, duration_ms, trigger = %trigger_type, error = %msg, "job failed")
            }
            InvocationResult::Timeout => warn!(
                job_id = %job.id,
                timeout_seconds = job.timeout_seconds,
                trigger = %trigger_type,
                "job timed out"
            ),
            InvocationResult::Cancelled => {
                info!(job_id = %job.id, duration_ms, trigger = %trigger_type, "job cancelled")
            }
        }

        let (persisted, disarm) = self.persist(job, &result, started_at).await;

        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            trigger_type,
            triggered_by: triggered_by.map(str::to_string),
            started_at,
            ended_at,
            duration_ms,
            outcome,
            input: job.params.clone(),
            output: match &result {
                InvocationResult::Success(v) => Some(v.clone()),
                _ => None,
            },
            error_message: result.error_message(job.timeout_seconds),
        };
        record_best_effort(self.logger.as_ref(), &record).await;

        ExecutionOutcome {
            record,
            job: persisted,
            disarm,
        }
    }

    /// Race the target against its deadline. The invocation runs on its own
    /// task so a panic is contained and a timeout can abort it outright.
    async fn invoke(
        &self,
        job: &ScheduledJob,
        params: super::model::Params,
        ctx: ExecContext,
        token: CancellationToken,
        caller: &CancellationToken,
    ) -> InvocationResult {
        let resolver = self.resolver.clone();
        let target = job.target.clone();
        let mut handle = tokio::spawn(async move { resolver.invoke(&target, params, ctx).await });
        let deadline = Duration::from_secs(job.timeout_seconds);

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(value)) => InvocationResult::Success(value),
                Ok(Err(e)) => InvocationResult::Failure(format!("{:#}", e)),
                Err(e) if e.is_panic() => InvocationResult::Failure(format!(
                    "target function panicked: {}",
                    panic_message(e.into_panic())
                )),
                Err(e) => InvocationResult::Failure(format!("target task failed: {}", e)),
            },
            _ = tokio::time::sleep(deadline) => {
                token.cancel();
                handle.abort();
                InvocationResult::Timeout
            }
            _ = caller.cancelled() => {
                token.cancel();
                handle.abort();
                InvocationResult::Cancelled
            }
        }
    }

    /// Write the transition under the job's lock, re-reading on a stale version.
    async fn persist(
        &self,
        job: &ScheduledJob,
        result: &InvocationResult,
        started_at: DateTime<Utc>,
    ) -> (Option<ScheduledJob>, bool) {
        let _guard = self.locks.lock(job.id).await;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let fresh = match self.store.get(job.id).await {
                Ok(Some(j)) => j,
                Ok(None) => {
                    debug!(job_id = %job.id, "job removed during execution; run state not written");
                    return (None, false);
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to load job after execution");
                    return (None, false);
                }
            };

            let (state, tripped) = transition(&fresh, result, started_at, Utc::now());
            match self.store.update_run_state(fresh.id, fresh.version, &state, None).await {
                Ok(updated) => {
                    if tripped {
                        warn!(
                            job_id = %updated.id,
                            tenant = %updated.tenant_id,
                            failures = updated.consecutive_failure_count,
                            threshold = updated.max_consecutive_failures,
                            "job auto-disabled after consecutive failures"
                        );
                    }
                    return (Some(updated), tripped);
                }
                Err(SchedulerError::StaleUpdate { .. }) => {
                    debug!(job_id = %job.id, attempt, "stale run-state write; retrying");
                }
                Err(SchedulerError::NotFound(_)) => {
                    debug!(job_id = %job.id, "job removed before run state was written");
                    return (None, false);
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to write run state");
                    return (None, false);
                }
            }
        }

        error!(job_id = %job.id, attempts = MAX_WRITE_ATTEMPTS, "gave up writing run state");
        (None, false)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::history::MemoryExecutionLog;
    use crate::scheduler::model::{JobDraft, JobId, Params};
    use crate::scheduler::target::TargetRegistry;
    use crate::storage::MemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        store: Arc<MemoryJobStore>,
        log: Arc<MemoryExecutionLog>,
        engine: ExecutionEngine,
    }

    fn harness(targets: TargetRegistry) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let log = Arc::new(MemoryExecutionLog::new());
        let engine = ExecutionEngine::new(
            store.clone(),
            Arc::new(targets),
            log.clone(),
            Arc::new(JobLocks::new()),
        );
        Harness { store, log, engine }
    }

    async fn job(store: &MemoryJobStore, target: &str, timeout: u64, max_failures: u32) -> ScheduledJob {
        let mut params = Params::new();
        params.insert("batch".into(), json!(7));
        let draft = JobDraft {
            name: "job".into(),
            description: None,
            cron_expr: "*/5 * * * *".into(),
            timezone: "UTC".into(),
            enabled: true,
            target: target.into(),
            params,
            timeout_seconds: timeout,
            max_consecutive_failures: max_failures,
            status: JobStatus::Active,
            consecutive_failure_count: 0,
            next_run_at: None,
            actor: "alice".into(),
        };
        store.upsert("acme", target, &draft).await.unwrap()
    }

    fn targets() -> TargetRegistry {
        let mut t = TargetRegistry::new();
        t.register_fn("ok", |params, _| async move {
            Ok(json!({ "saw_context": params.contains_key(CONTEXT_PARAM) }))
        })
        .register_fn("fail", |_, _| async move { anyhow::bail!("upstream returned 503") })
        .register_fn("slow", |_, _| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!("late"))
        })
        .register_fn("panic", |_, _| async move {
            if true {
                panic!("bad index");
            }
            Ok(Value::Null)
        });
        t
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let h = harness(targets());
        let j = job(&h.store, "ok", 5, 3).await;
        let mut state = j.run_state();
        state.consecutive_failure_count = 2;
        state.last_error = Some("old".into());
        let j = h.store.update_run_state(j.id, j.version, &state, None).await.unwrap();

        let out = h.engine.execute(&j, TriggerType::Scheduled, None, CancellationToken::new()).await;
        assert_eq!(out.record.outcome, Outcome::Success);
        assert_eq!(out.record.output, Some(json!({ "saw_context": true })));
        assert!(!out.record.input.contains_key(CONTEXT_PARAM));
        let after = out.job.unwrap();
        assert_eq!(after.consecutive_failure_count, 0);
        assert_eq!(after.status, JobStatus::Active);
        assert!(after.last_error.is_none());
        assert!(after.next_run_at.unwrap() > after.last_run_at.unwrap());
        assert_eq!(h.log.count(j.id).await, 1);
    }

    #[tokio::test]
    async fn test_failure_increments_and_trips_threshold() {
        let h = harness(targets());
        let j = job(&h.store, "fail", 5, 2).await;

        let first = h.engine.execute(&j, TriggerType::Scheduled, None, CancellationToken::new()).await;
        assert_eq!(first.record.outcome, Outcome::Failure);
        assert_eq!(first.record.error_message.as_deref(), Some("upstream returned 503"));
        assert!(!first.disarm);
        let j1 = first.job.unwrap();
        assert_eq!(j1.consecutive_failure_count, 1);
        assert_eq!(j1.status, JobStatus::Active);
        assert!(j1.next_run_at.is_some());

        let second = h.engine.execute(&j1, TriggerType::Scheduled, None, CancellationToken::new()).await;
        assert!(second.disarm);
        let j2 = second.job.unwrap();
        assert_eq!(j2.status, JobStatus::Error);
        assert!(!j2.enabled);
        assert!(j2.next_run_at.is_none());
        assert_eq!(h.log.count(j.id).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_invocation() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let mut t = TargetRegistry::new();
        t.register_fn("slow", move |_, _| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let h = harness(t);
        let j = job(&h.store, "slow", 5, 3).await;

        let out = h.engine.execute(&j, TriggerType::Scheduled, None, CancellationToken::new()).await;
        assert_eq!(out.record.outcome, Outcome::Timeout);
        let after = out.job.unwrap();
        assert_eq!(after.consecutive_failure_count, 1);
        assert_eq!(after.status, JobStatus::Active);

        // Well past the target's own sleep: the aborted task never completes.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let h = harness(targets());
        let j = job(&h.store, "panic", 5, 3).await;
        let out = h.engine.execute(&j, TriggerType::Manual, Some("bob"), CancellationToken::new()).await;
        assert_eq!(out.record.outcome, Outcome::Failure);
        assert!(out.record.error_message.unwrap().contains("bad index"));
        assert_eq!(out.record.triggered_by.as_deref(), Some("bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_does_not_count() {
        let h = harness(targets());
        let j = job(&h.store, "slow", 60, 1).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let out = h.engine.execute(&j, TriggerType::Manual, None, cancel).await;
        assert_eq!(out.record.outcome, Outcome::Failure);
        assert_eq!(out.record.error_message.as_deref(), Some("execution cancelled"));
        let after = out.job.unwrap();
        assert_eq!(after.consecutive_failure_count, 0);
        assert_eq!(after.status, JobStatus::Active);
    }

    struct FailingLog;

    #[async_trait::async_trait]
    impl ExecutionLogger for FailingLog {
        async fn append(&self, _record: &ExecutionRecord) -> crate::error::Result<()> {
            Err(SchedulerError::Storage("disk full".into()))
        }
        async fn list(&self, _job_id: JobId, _limit: usize) -> crate::error::Result<Vec<ExecutionRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_log_write_failure_keeps_run_state() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = ExecutionEngine::new(
            store.clone(),
            Arc::new(targets()),
            Arc::new(FailingLog),
            Arc::new(JobLocks::new()),
        );
        let j = job(&store, "fail", 5, 3).await;

        let out = engine.execute(&j, TriggerType::Manual, Some("bob"), CancellationToken::new()).await;
        assert_eq!(out.record.outcome, Outcome::Failure);
        assert_eq!(out.record.error_message.as_deref(), Some("upstream returned 503"));

        let stored = store.get(j.id).await.unwrap().unwrap();
        assert_eq!(stored.consecutive_failure_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("upstream returned 503"));
        assert!(stored.last_run_at.is_some());
        assert!(stored.version > j.version);
    }

    #[tokio::test]
    async fn test_deleted_job_still_logs_record() {
        let h = harness(targets());
        let j = job(&h.store, "ok", 5, 3).await;
        h.store.delete(j.id).await.unwrap();

        let out = h.engine.execute(&j, TriggerType::Manual, None, CancellationToken::new()).await;
        assert!(out.job.is_none());
        assert_eq!(h.log.count(j.id).await, 1);
    }

    #[test]
    fn test_transition_on_disabled_job_keeps_status() {
        let now = Utc::now();
        let mut j = ScheduledJob {
            id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            job_key: "k".into(),
            name: "n".into(),
            description: None,
            cron_expr: "0 * * * *".into(),
            timezone: "UTC".into(),
            enabled: false,
            target: "ok".into(),
            params: Params::new(),
            timeout_seconds: 5,
            max_consecutive_failures: 3,
            status: JobStatus::Paused,
            consecutive_failure_count: 1,
            last_run_at: None,
            next_run_at: None,
            last_error: None,
            last_result: None,
            created_by: "a".into(),
            updated_by: "a".into(),
            created_at: now,
            updated_at: now,
            version: 1,
        };

        let (state, tripped) = transition(&j, &InvocationResult::Success(json!(1)), now, now);
        assert!(!tripped);
        assert_eq!(state.status, JobStatus::Paused);
        assert_eq!(state.consecutive_failure_count, 0);
        assert!(state.next_run_at.is_none());

        j.consecutive_failure_count = 2;
        let (state, tripped) = transition(&j, &InvocationResult::Timeout, now, now);
        assert!(tripped);
        assert_eq!(state.status, JobStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("execution timed out after 5s"));
    }
}
