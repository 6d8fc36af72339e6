//! JobRegistry -- the in-process scheduling authority.
//!
//! Holds one timer task per schedulable job. A timer sleeps until the job's
//! next fire time, hands the fire off to a tracked task, then computes the
//! next slot. Each job has a run gate: a fire that finds the gate held is
//! skipped instead of running concurrently with the previous invocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::cron;
use super::engine::{ExecutionEngine, ExecutionOutcome};
use super::locks::JobLocks;
use super::model::{JobId, ScheduledJob, TriggerType};
use crate::error::{Result, SchedulerError};
use crate::storage::JobStore;

/// Point-in-time counters, exposed on the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub armed: usize,
    pub in_flight: usize,
    pub fired: u64,
    pub skipped_overlaps: u64,
}

struct Timer {
    handle: JoinHandle<()>,
    tenant_id: String,
    cron_expr: String,
    timezone: String,
}

impl Timer {
    fn matches(&self, job: &ScheduledJob) -> bool {
        self.cron_expr == job.cron_expr && self.timezone == job.timezone
    }
}

struct Shared {
    store: Arc<dyn JobStore>,
    engine: Arc<ExecutionEngine>,
    /// Serializes run-state writes; shared with the engine and the service.
    locks: Arc<JobLocks>,
    /// Held for the whole duration of a run.
    gates: JobLocks,
    timers: Mutex<HashMap<JobId, Timer>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    fired: AtomicU64,
    skipped_overlaps: AtomicU64,
}

/// Cheap to clone; all clones drive the same set of timers.
#[derive(Clone)]
pub struct JobRegistry {
    shared: Arc<Shared>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>, engine: Arc<ExecutionEngine>, locks: Arc<JobLocks>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                engine,
                locks,
                gates: JobLocks::new(),
                timers: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                fired: AtomicU64::new(0),
                skipped_overlaps: AtomicU64::new(0),
            }),
        }
    }

    /// Allow timers to be armed. Arms requested before `start` are ignored.
    pub fn start(&self) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            warn!("registry already stopped; start ignored");
            return;
        }
        self.shared.started.store(true, Ordering::SeqCst);
        info!("job registry started");
    }

    pub fn is_running(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst) && !self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Disarm every timer, cancel in-flight runs, and wait up to `grace` for
    /// them to record their outcome.
    pub async fn stop(&self, grace: Duration) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let timers: Vec<Timer> = {
            let mut timers = self.shared.timers.lock().unwrap_or_else(|p| p.into_inner());
            timers.drain().map(|(_, t)| t).collect()
        };
        for t in &timers {
            t.handle.abort();
        }

        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        if tokio::time::timeout(grace, self.shared.tracker.wait()).await.is_err() {
            warn!(
                in_flight = self.shared.in_flight.load(Ordering::SeqCst),
                "in-flight runs did not finish within the shutdown grace period"
            );
        }
        info!(disarmed = timers.len(), "job registry stopped");
    }

    /// Replace any timer for this job with a fresh one. Jobs that are
    /// disabled or in error are disarmed instead.
    pub fn arm(&self, job: &ScheduledJob) {
        if !self.is_running() {
            debug!(job_id = %job.id, "registry not running; arm ignored");
            return;
        }
        if !job.is_schedulable() {
            self.disarm(job.id);
            return;
        }

        let handle = tokio::spawn(timer_loop(
            self.shared.clone(),
            job.id,
            job.cron_expr.clone(),
            job.timezone.clone(),
        ));
        let timer = Timer {
            handle,
            tenant_id: job.tenant_id.clone(),
            cron_expr: job.cron_expr.clone(),
            timezone: job.timezone.clone(),
        };

        let previous = {
            let mut timers = self.shared.timers.lock().unwrap_or_else(|p| p.into_inner());
            timers.insert(job.id, timer)
        };
        if let Some(prev) = previous {
            prev.handle.abort();
        }
        debug!(job_id = %job.id, cron = %job.cron_expr, tz = %job.timezone, "timer armed");
    }

    pub fn disarm(&self, id: JobId) {
        let removed = {
            let mut timers = self.shared.timers.lock().unwrap_or_else(|p| p.into_inner());
            timers.remove(&id)
        };
        if let Some(timer) = removed {
            timer.handle.abort();
            debug!(job_id = %id, "timer disarmed");
        }
    }

    /// Disarm and drop the run gate of a job that no longer exists.
    pub fn forget(&self, id: JobId) {
        self.disarm(id);
        self.shared.gates.forget(id);
    }

    pub fn is_armed(&self, id: JobId) -> bool {
        let timers = self.shared.timers.lock().unwrap_or_else(|p| p.into_inner());
        timers.get(&id).is_some_and(|t| !t.handle.is_finished())
    }

    /// Converge the live timers onto `jobs`: arm what is schedulable, leave
    /// unchanged timers running, disarm everything else.
    ///
    /// Returns the number of armed timers afterwards.
    pub fn reconcile(&self, jobs: &[ScheduledJob]) -> usize {
        self.reconcile_scoped(None, jobs)
    }

    /// Like [`reconcile`](Self::reconcile), but only timers belonging to
    /// `tenant` are candidates for disarming.
    pub fn reconcile_tenant(&self, tenant: &str, jobs: &[ScheduledJob]) -> usize {
        self.reconcile_scoped(Some(tenant), jobs)
    }

    fn reconcile_scoped(&self, tenant: Option<&str>, jobs: &[ScheduledJob]) -> usize {
        let wanted: HashMap<JobId, &ScheduledJob> = jobs
            .iter()
            .filter(|j| j.is_schedulable())
            .map(|j| (j.id, j))
            .collect();

        let stale: Vec<JobId> = {
            let timers = self.shared.timers.lock().unwrap_or_else(|p| p.into_inner());
            timers
                .iter()
                .filter(|(id, t)| tenant.map_or(true, |tn| t.tenant_id == tn) && !wanted.contains_key(*id))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale {
            self.disarm(id);
        }

        for job in wanted.values() {
            let current = {
                let timers = self.shared.timers.lock().unwrap_or_else(|p| p.into_inner());
                timers.get(&job.id).map(|t| t.matches(job) && !t.handle.is_finished())
            };
            if current != Some(true) {
                self.arm(job);
            }
        }

        self.stats().armed
    }

    /// Execute a job outside its schedule. Waits for a scheduled run of the
    /// same job to finish first; the timer is left untouched.
    pub async fn run_now(
        &self,
        id: JobId,
        triggered_by: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::RegistryStopped);
        }

        let _gate = tokio::select! {
            g = self.shared.gates.lock(id) => g,
            _ = cancel.cancelled() => return Err(SchedulerError::Cancelled),
        };
        let job = match self.shared.store.get(id).await? {
            Some(job) => job,
            None => {
                drop(_gate);
                self.shared.gates.forget(id);
                return Err(SchedulerError::NotFound(id));
            }
        };

        // Either the caller or a registry shutdown stops the run.
        let token = self.shared.shutdown.child_token();
        let link = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => token.cancel(),
                    _ = token.cancelled() => {}
                }
            })
        };

        let outcome = {
            let _in_flight = InFlight::enter(&self.shared.in_flight);
            self.shared
                .engine
                .execute(&job, TriggerType::Manual, triggered_by, token)
                .await
        };
        link.abort();

        if outcome.disarm {
            sync_timer(&self.shared, id).await;
        }
        if outcome.job.is_none() {
            drop(_gate);
            self.shared.gates.forget(id);
        }
        Ok(outcome)
    }

    pub fn stats(&self) -> RegistryStats {
        let armed = self.shared.timers.lock().unwrap_or_else(|p| p.into_inner()).len();
        RegistryStats {
            armed,
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            fired: self.shared.fired.load(Ordering::SeqCst),
            skipped_overlaps: self.shared.skipped_overlaps.load(Ordering::SeqCst),
        }
    }
}

async fn timer_loop(shared: Arc<Shared>, id: JobId, cron_expr: String, timezone: String) {
    loop {
        let now = Utc::now();
        let next = match cron::next_fire_time(&cron_expr, &timezone, now) {
            Ok(next) => next,
            Err(e) => {
                warn!(job_id = %id, error = %e, "cannot compute next fire; timer stops");
                return;
            }
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        debug!(job_id = %id, next = %next, "timer sleeping until next fire");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shared.shutdown.cancelled() => return,
        }

        // Wall clock can lag the monotonic sleep by a hair; wait out the rest
        // so the next computation lands on the following slot.
        let now = Utc::now();
        if now < next {
            tokio::time::sleep((next - now).to_std().unwrap_or(Duration::ZERO)).await;
        }

        let fire = shared.clone();
        shared.tracker.spawn(async move { fire_scheduled(fire, id, next).await });
    }
}

async fn fire_scheduled(shared: Arc<Shared>, id: JobId, scheduled_for: DateTime<Utc>) {
    let Some(_gate) = shared.gates.try_lock(id) else {
        shared.skipped_overlaps.fetch_add(1, Ordering::SeqCst);
        warn!(job_id = %id, "previous run still in flight; scheduled fire skipped");
        return;
    };

    let job = match shared.store.get(id).await {
        Ok(Some(job)) if job.is_schedulable() => job,
        Ok(found) => {
            debug!(job_id = %id, exists = found.is_some(), "scheduling fault: fired job is not schedulable");
            sync_timer(&shared, id).await;
            if found.is_none() {
                drop(_gate);
                shared.gates.forget(id);
            }
            return;
        }
        Err(e) => {
            error!(job_id = %id, error = %e, "failed to load job for scheduled fire");
            return;
        }
    };

    shared.fired.fetch_add(1, Ordering::SeqCst);
    let outcome = {
        let _in_flight = InFlight::enter(&shared.in_flight);
        shared
            .engine
            .execute_scheduled(&job, scheduled_for, shared.shutdown.child_token())
            .await
    };

    if outcome.disarm || outcome.job.is_none() {
        sync_timer(&shared, id).await;
    }
    // Deleted while running: the gate entry outlived the job.
    if outcome.job.is_none() {
        drop(_gate);
        shared.gates.forget(id);
    }
}

/// Re-read the job under its write lock and drop its timer unless it is
/// still schedulable. A concurrent re-enable re-arms under the same lock, so
/// this can never undo it.
async fn sync_timer(shared: &Shared, id: JobId) {
    let _guard = shared.locks.lock(id).await;
    let keep = matches!(shared.store.get(id).await, Ok(Some(ref j)) if j.is_schedulable());
    if !keep {
        let removed = {
            let mut timers = shared.timers.lock().unwrap_or_else(|p| p.into_inner());
            timers.remove(&id)
        };
        if let Some(timer) = removed {
            timer.handle.abort();
            debug!(job_id = %id, "timer disarmed after run");
        }
    }
}
