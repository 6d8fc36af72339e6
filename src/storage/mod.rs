//! Durable storage -- the job store contract, SQLite backends, migrations.

pub mod executions;
pub mod jobs;
pub mod memory;
pub mod schema;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::Result as SchedResult;
use crate::scheduler::model::{JobDraft, JobFilter, JobId, RunState, ScheduledJob};

pub use self::executions::SqliteExecutionLog;
pub use self::jobs::SqliteJobStore;
pub use self::memory::MemoryJobStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically.
pub(crate) fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> std::result::Result<Option<DateTime<Utc>>, String> {
    s.as_deref().map(parse_ts).transpose()
}

/// Durable records of job definitions and their run state.
///
/// Every write bumps the job's `version`; `update_run_state` rejects a write
/// whose expected version no longer matches.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: JobId) -> SchedResult<Option<ScheduledJob>>;

    async fn find_by_key(&self, tenant: &str, key: &str) -> SchedResult<Option<ScheduledJob>>;

    /// Insert or replace the definition keyed on `(tenant, key)`.
    async fn upsert(&self, tenant: &str, key: &str, draft: &JobDraft) -> SchedResult<ScheduledJob>;

    /// Write the lifecycle fields. `actor` overrides `updated_by` when set.
    async fn update_run_state(
        &self,
        id: JobId,
        expected_version: i64,
        state: &RunState,
        actor: Option<&str>,
    ) -> SchedResult<ScheduledJob>;

    async fn list(&self, tenant: Option<&str>, filter: &JobFilter) -> SchedResult<Vec<ScheduledJob>>;

    /// Jobs that should hold a timer: enabled and not in error.
    async fn list_enabled(&self, tenant: Option<&str>) -> SchedResult<Vec<ScheduledJob>>;

    /// Returns whether a row was removed.
    async fn delete(&self, id: JobId) -> SchedResult<bool>;
}
